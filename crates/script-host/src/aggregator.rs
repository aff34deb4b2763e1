//! Assertion and test block aggregation
//!
//! Records land in the innermost open block, or at the root when none is
//! open. Blocks form a stack; a close must name the top of the stack.

use chrono::{DateTime, Utc};
use hostbridge_protocol::{
    AssertionRecord, Diagnostic, DiagnosticKind, TestBlockReport, TestReport, TestStatus,
};

#[derive(Debug, Clone)]
struct OpenBlock {
    name: String,
    opened_at: DateTime<Utc>,
    records: Vec<AssertionRecord>,
    children: Vec<TestBlockReport>,
}

impl OpenBlock {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            opened_at: Utc::now(),
            records: Vec::new(),
            children: Vec::new(),
        }
    }

    fn finish(self, closed_at: DateTime<Utc>, truncated: bool) -> TestBlockReport {
        let mut block = TestBlockReport {
            name: self.name,
            opened_at: self.opened_at,
            closed_at,
            status: TestStatus::Pass,
            skip: false,
            truncated,
            records: self.records,
            children: self.children,
        };
        if !block.all_passed() {
            block.status = TestStatus::Fail;
        }
        block
    }
}

/// Per-instance assertion state
#[derive(Debug, Default)]
pub struct TestAggregator {
    records: Vec<AssertionRecord>,
    stack: Vec<OpenBlock>,
    closed: Vec<TestBlockReport>,
    diagnostics: Vec<Diagnostic>,
    skipped: bool,
}

impl TestAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_assert(&mut self, passed: bool, message: impl Into<String>) {
        let record = AssertionRecord::new(passed, message);
        match self.stack.last_mut() {
            Some(block) => block.records.push(record),
            None => self.records.push(record),
        }
    }

    pub fn open_test(&mut self, name: &str) {
        self.stack.push(OpenBlock::new(name));
    }

    /// Close the innermost block if it is `name`
    ///
    /// Anything else leaves the stack untouched and records a
    /// [`DiagnosticKind::StructuralTestMismatch`]. Returns whether a block closed.
    pub fn close_test(&mut self, name: &str) -> bool {
        let top = self.stack.last().map(|b| b.name.as_str());
        if top != Some(name) {
            let message = match top {
                Some(open) => format!("close_test(`{name}`) while `{open}` is the innermost open block"),
                None => format!("close_test(`{name}`) with no open block"),
            };
            tracing::warn!(%message, "Test block mismatch");
            self.diagnostics.push(Diagnostic {
                kind: DiagnosticKind::StructuralTestMismatch,
                message,
            });
            return false;
        }

        let Some(block) = self.stack.pop() else {
            return false;
        };
        let report = block.finish(Utc::now(), false);
        self.push_closed(report);
        true
    }

    pub fn test_skip(&mut self) {
        self.skipped = true;
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    /// Names of blocks still open, outermost first
    pub fn open_blocks(&self) -> Vec<&str> {
        self.stack.iter().map(|b| b.name.as_str()).collect()
    }

    fn push_closed(&mut self, report: TestBlockReport) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(report),
            None => self.closed.push(report),
        }
    }

    /// Build the report without consuming recorded state
    ///
    /// Blocks still open are finalized innermost-first and flagged as truncated.
    pub fn report(&self) -> TestReport {
        let mut blocks = self.closed.clone();
        let mut diagnostics = self.diagnostics.clone();

        let now = Utc::now();
        let mut carried: Option<TestBlockReport> = None;
        for open in self.stack.iter().rev() {
            let mut open = open.clone();
            if let Some(child) = carried.take() {
                open.children.push(child);
            }
            diagnostics.push(Diagnostic {
                kind: DiagnosticKind::UnclosedTestBlock,
                message: format!("test block `{}` was never closed", open.name),
            });
            carried = Some(open.finish(now, true));
        }
        if let Some(outermost) = carried {
            blocks.push(outermost);
        }

        let mut report = TestReport {
            status: TestStatus::None,
            skipped: self.skipped,
            records: self.records.clone(),
            blocks,
            diagnostics,
        };

        report.status = if self.skipped {
            mark_skipped(&mut report.blocks);
            TestStatus::Skip
        } else if report.failed_count() > 0 {
            TestStatus::Fail
        } else if report.passed_count() > 0 || !report.blocks.is_empty() {
            TestStatus::Pass
        } else {
            TestStatus::None
        };
        report
    }
}

fn mark_skipped(blocks: &mut [TestBlockReport]) {
    for block in blocks {
        block.skip = true;
        block.status = TestStatus::Skip;
        mark_skipped(&mut block.children);
    }
}

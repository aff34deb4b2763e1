//! Assertion and test block report model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a block or a whole report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Nothing was recorded
    #[default]
    None,
    Pass,
    Fail,
    /// The run called `test_skip`; assertions are informational only
    Skip,
}

/// A single pass/fail expectation recorded by a script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionRecord {
    pub passed: bool,
    pub message: String,
}

impl AssertionRecord {
    #[must_use]
    pub fn new(passed: bool, message: impl Into<String>) -> Self {
        Self {
            passed,
            message: message.into(),
        }
    }
}

/// A closed (or force-finalized) test block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBlockReport {
    pub name: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub status: TestStatus,
    pub skip: bool,
    /// Block was still open when the instance finished or was aborted
    pub truncated: bool,
    pub records: Vec<AssertionRecord>,
    pub children: Vec<TestBlockReport>,
}

impl TestBlockReport {
    /// True when every record in this block and its descendants passed
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.records.iter().all(|r| r.passed) && self.children.iter().all(Self::all_passed)
    }

    fn count(&self, passed: bool) -> usize {
        self.records.iter().filter(|r| r.passed == passed).count()
            + self.children.iter().map(|c| c.count(passed)).sum::<usize>()
    }
}

/// Kind of framework-level diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// `close_test` did not match the innermost open block
    StructuralTestMismatch,
    /// A block was still open when the instance finished
    UnclosedTestBlock,
}

/// Framework diagnostic, distinct from user-authored assertion failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Aggregated assertions and test blocks of one script instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub status: TestStatus,
    pub skipped: bool,
    /// Assertions recorded while no block was open
    pub records: Vec<AssertionRecord>,
    /// Top-level blocks in close order
    pub blocks: Vec<TestBlockReport>,
    pub diagnostics: Vec<Diagnostic>,
}

impl TestReport {
    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.records.iter().filter(|r| r.passed).count()
            + self.blocks.iter().map(|b| b.count(true)).sum::<usize>()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.records.iter().filter(|r| !r.passed).count()
            + self.blocks.iter().map(|b| b.count(false)).sum::<usize>()
    }

    /// Find a block by name anywhere in the tree (depth-first)
    #[must_use]
    pub fn find_block(&self, name: &str) -> Option<&TestBlockReport> {
        fn walk<'a>(blocks: &'a [TestBlockReport], name: &str) -> Option<&'a TestBlockReport> {
            blocks.iter().find_map(|b| {
                if b.name == name {
                    Some(b)
                } else {
                    walk(&b.children, name)
                }
            })
        }
        walk(&self.blocks, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(name: &str, records: Vec<AssertionRecord>, children: Vec<TestBlockReport>) -> TestBlockReport {
        let now = Utc::now();
        TestBlockReport {
            name: name.into(),
            opened_at: now,
            closed_at: now,
            status: TestStatus::Pass,
            skip: false,
            truncated: false,
            records,
            children,
        }
    }

    #[test]
    fn counts_include_nested_blocks() {
        let inner = block("inner", vec![AssertionRecord::new(false, "nope")], vec![]);
        let outer = block("outer", vec![AssertionRecord::new(true, "ok")], vec![inner]);
        let report = TestReport {
            records: vec![AssertionRecord::new(true, "root")],
            blocks: vec![outer],
            ..Default::default()
        };

        assert_eq!(report.passed_count(), 2);
        assert_eq!(report.failed_count(), 1);
        assert!(!report.blocks[0].all_passed());
        assert_eq!(report.find_block("inner").map(|b| b.records.len()), Some(1));
        assert!(report.find_block("missing").is_none());
    }
}

//! Operation registry
//!
//! Every host call crosses the sandbox boundary as an operation name plus a
//! JSON array of positional arguments. [`OpCall::parse`] turns that pair into
//! a typed call, rejecting unknown names and malformed arguments before any
//! side effect happens; [`HostOps`] is the capability interface that executes
//! it.

use async_trait::async_trait;
use hostbridge_protocol::{HttpRequestSpec, LogLevel, Operation};
use serde_json::{json, Value};

use crate::BridgeError;

/// A parsed host operation with typed arguments
#[derive(Debug, Clone, PartialEq)]
pub enum OpCall {
    Sleep { ms: u64 },
    HttpFetch(HttpRequestSpec),
    WaitShared { key: String },
    Log { level: LogLevel, message: String },
    GetTestcase,
    Response,
    SetEnv { key: String, value: String },
    GetEnv { key: String },
    AddHeader { name: String, value: String },
    AddParams { name: String, value: String },
    SetShared { key: String, value: Value },
    GetShared { key: String },
    OpenTest { name: String },
    CloseTest { name: String },
    AppendAssert { passed: bool, message: String },
    TestSkip,
    Assert { expect: Value, actual: Value },
    AssertNlp { expect: String, actual: String, threshold: f64 },
    Equal { a: Value, b: Value },
    NlpKeywords { text: String, k: usize },
    NlpTags { text: String },
    NlpTagFilter { text: String, tags: Vec<String> },
    NlpSimilarity { a: String, b: String },
}

/// Positional argument reader for one operation
struct Args<'a> {
    op: Operation,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    fn new(op: Operation, args: &'a Value) -> Result<Self, BridgeError> {
        let values = args
            .as_array()
            .ok_or_else(|| BridgeError::invalid(op.name(), "arguments must be an array"))?;
        if values.len() != op.arity() {
            return Err(BridgeError::invalid(
                op.name(),
                format!("expected {} argument(s), got {}", op.arity(), values.len()),
            ));
        }
        Ok(Self { op, values })
    }

    fn fail(&self, index: usize, expected: &str) -> BridgeError {
        BridgeError::invalid(
            self.op.name(),
            format!("argument {} must be {expected}", index + 1),
        )
    }

    fn value(&self, index: usize) -> Value {
        self.values[index].clone()
    }

    fn string(&self, index: usize) -> Result<String, BridgeError> {
        self.values[index]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| self.fail(index, "a string"))
    }

    fn boolean(&self, index: usize) -> Result<bool, BridgeError> {
        self.values[index]
            .as_bool()
            .ok_or_else(|| self.fail(index, "a boolean"))
    }

    fn number(&self, index: usize) -> Result<f64, BridgeError> {
        self.values[index]
            .as_f64()
            .filter(|n| n.is_finite())
            .ok_or_else(|| self.fail(index, "a number"))
    }

    /// Non-negative integer; JS numbers arrive as floats, so whole floats are accepted
    fn count(&self, index: usize) -> Result<u64, BridgeError> {
        let value = &self.values[index];
        if let Some(n) = value.as_u64() {
            return Ok(n);
        }
        match value.as_f64() {
            Some(n) if n.is_finite() && n >= 0.0 => Ok(n.trunc() as u64),
            _ => Err(self.fail(index, "a non-negative number")),
        }
    }

    fn strings(&self, index: usize) -> Result<Vec<String>, BridgeError> {
        let items = self.values[index]
            .as_array()
            .ok_or_else(|| self.fail(index, "an array of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| self.fail(index, "an array of strings"))
            })
            .collect()
    }

    fn request(&self, index: usize) -> Result<HttpRequestSpec, BridgeError> {
        if !self.values[index].is_object() {
            return Err(self.fail(index, "a request object"));
        }
        serde_json::from_value(self.value(index))
            .map_err(|e| BridgeError::invalid(self.op.name(), e.to_string()))
    }
}

impl OpCall {
    /// Parse a raw `(name, args)` pair into a typed call
    pub fn parse(name: &str, args: &Value) -> Result<Self, BridgeError> {
        let op = Operation::from_name(name)
            .ok_or_else(|| BridgeError::UnknownOperation(name.to_string()))?;
        let a = Args::new(op, args)?;

        let call = match op {
            Operation::Sleep => Self::Sleep { ms: a.count(0)? },
            Operation::HttpFetch => Self::HttpFetch(a.request(0)?),
            Operation::WaitShared => Self::WaitShared { key: a.string(0)? },
            Operation::Log => Self::Log {
                level: LogLevel::Info,
                message: a.string(0)?,
            },
            Operation::Warn => Self::Log {
                level: LogLevel::Warn,
                message: a.string(0)?,
            },
            Operation::Error => Self::Log {
                level: LogLevel::Error,
                message: a.string(0)?,
            },
            Operation::GetTestcase => Self::GetTestcase,
            Operation::Response => Self::Response,
            Operation::SetEnv => Self::SetEnv {
                key: a.string(0)?,
                value: a.string(1)?,
            },
            Operation::GetEnv => Self::GetEnv { key: a.string(0)? },
            Operation::AddHeader => Self::AddHeader {
                name: a.string(0)?,
                value: a.string(1)?,
            },
            Operation::AddParams => Self::AddParams {
                name: a.string(0)?,
                value: a.string(1)?,
            },
            Operation::SetShared => Self::SetShared {
                key: a.string(0)?,
                value: a.value(1),
            },
            Operation::GetShared => Self::GetShared { key: a.string(0)? },
            Operation::OpenTest => Self::OpenTest { name: a.string(0)? },
            Operation::CloseTest => Self::CloseTest { name: a.string(0)? },
            Operation::AppendAssert => Self::AppendAssert {
                passed: a.boolean(0)?,
                message: a.string(1)?,
            },
            Operation::TestSkip => Self::TestSkip,
            Operation::Assert => Self::Assert {
                expect: a.value(0),
                actual: a.value(1),
            },
            Operation::AssertNlp => Self::AssertNlp {
                expect: a.string(0)?,
                actual: a.string(1)?,
                threshold: a.number(2)?,
            },
            Operation::Equal => Self::Equal {
                a: a.value(0),
                b: a.value(1),
            },
            Operation::NlpKeywords => Self::NlpKeywords {
                text: a.string(0)?,
                k: usize::try_from(a.count(1)?).unwrap_or(usize::MAX),
            },
            Operation::NlpTags => Self::NlpTags { text: a.string(0)? },
            Operation::NlpTagFilter => Self::NlpTagFilter {
                text: a.string(0)?,
                tags: a.strings(1)?,
            },
            Operation::NlpSimilarity => Self::NlpSimilarity {
                a: a.string(0)?,
                b: a.string(1)?,
            },
        };
        Ok(call)
    }

    /// The catalog entry this call belongs to
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::Sleep { .. } => Operation::Sleep,
            Self::HttpFetch(_) => Operation::HttpFetch,
            Self::WaitShared { .. } => Operation::WaitShared,
            Self::Log { level, .. } => match level {
                LogLevel::Info => Operation::Log,
                LogLevel::Warn => Operation::Warn,
                LogLevel::Error => Operation::Error,
            },
            Self::GetTestcase => Operation::GetTestcase,
            Self::Response => Operation::Response,
            Self::SetEnv { .. } => Operation::SetEnv,
            Self::GetEnv { .. } => Operation::GetEnv,
            Self::AddHeader { .. } => Operation::AddHeader,
            Self::AddParams { .. } => Operation::AddParams,
            Self::SetShared { .. } => Operation::SetShared,
            Self::GetShared { .. } => Operation::GetShared,
            Self::OpenTest { .. } => Operation::OpenTest,
            Self::CloseTest { .. } => Operation::CloseTest,
            Self::AppendAssert { .. } => Operation::AppendAssert,
            Self::TestSkip => Operation::TestSkip,
            Self::Assert { .. } => Operation::Assert,
            Self::AssertNlp { .. } => Operation::AssertNlp,
            Self::Equal { .. } => Operation::Equal,
            Self::NlpKeywords { .. } => Operation::NlpKeywords,
            Self::NlpTags { .. } => Operation::NlpTags,
            Self::NlpTagFilter { .. } => Operation::NlpTagFilter,
            Self::NlpSimilarity { .. } => Operation::NlpSimilarity,
        }
    }
}

/// Capability interface handed to the sandbox
///
/// The sandbox can do nothing except through this trait, which makes the set
/// of host effects statically enumerable and easy to mock.
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Execute one parsed operation
    async fn invoke(&self, call: OpCall) -> Result<Value, BridgeError>;

    /// Called before each script of a chain starts running
    fn enter_scope(&self, _scope: &str) {}
}

/// Wrap an operation result in the `{"ok": ..}` / `{"err": ..}` wire envelope
#[must_use]
pub fn envelope(result: Result<Value, BridgeError>) -> Value {
    match result {
        Ok(value) => json!({ "ok": value }),
        Err(e) => json!({
            "err": {
                "kind": e.kind().as_str(),
                "message": e.to_string(),
            }
        }),
    }
}

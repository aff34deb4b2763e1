//! Hostbridge Script Host
//!
//! QuickJS sandbox for running user-authored API test scripts against a fixed
//! set of host operations.
//!
//! ## Host API
//!
//! Scripts have access to the following API:
//!
//! - `console.log/warn/error(...args)` - Write to the instance log
//! - `await sleep(ms)` - Suspend the script (at most `max_sleep_ms`)
//! - `await fetch(request)` - Perform an HTTP request through the host
//! - `assert(expect, actual)` - Record a deep-equality assertion
//! - `assert_nlp(expect, actual, threshold)` - Record a similarity assertion
//! - `testcase()` - Structured test case data supplied by the host
//! - `nlp.keywords/tags/tag_filter/similarity` - Text helpers
//! - `host.set_env/get_env/add_header/add_params` - Run context mutators
//! - `host.set_shared/get_shared/await host.wait_shared` - Cross-script state
//! - `host.resp()` - The response of the request under test
//! - `host.test(name, fn)` / `host.test_skip()` - Test blocks and skipping

mod aggregator;
mod bindings;
mod context;
mod lock;
mod normalize;
mod registry;
mod run;
mod runtime;
mod shared;

pub use aggregator::*;
pub use bindings::*;
pub use context::*;
pub use normalize::*;
pub use registry::*;
pub use run::*;
pub use runtime::*;
pub use shared::*;

use std::collections::BTreeMap;

use hostbridge_protocol::{
    EnvOverride, HeaderAddition, InstanceId, LogEntry, ParamAddition, TestReport,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from script execution
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Script execution timed out")]
    Timeout,

    #[error("Script exceeded memory limit ({0} bytes)")]
    MemoryLimit(usize),

    #[error("Script was cancelled")]
    Cancelled,

    #[error("JavaScript error: {0}")]
    JsError(String),

    #[error("Runtime initialization failed: {0}")]
    InitError(String),
}

/// Errors from a single host operation
///
/// These cross into the sandbox as a `HostError` carrying [`ErrorKind`], so a
/// script can catch and inspect them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("Unknown operation `{0}`")]
    UnknownOperation(String),

    #[error("Invalid argument for `{op}`: {reason}")]
    InvalidArgument { op: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out waiting for shared value `{0}`")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Host collaborator failed: {0}")]
    Host(String),
}

impl BridgeError {
    pub(crate) fn invalid(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op: op.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownOperation(_) => ErrorKind::UnknownOperation,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Host(_) => ErrorKind::HostError,
        }
    }
}

/// Stable error tag visible to scripts as `err.kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownOperation,
    InvalidArgument,
    NetworkError,
    Timeout,
    Cancelled,
    HostError,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownOperation => "UnknownOperation",
            Self::InvalidArgument => "InvalidArgument",
            Self::NetworkError => "NetworkError",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::HostError => "HostError",
        }
    }
}

/// Configuration for script execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Maximum execution time of one instance in milliseconds
    pub timeout_ms: u64,
    /// Maximum memory usage in bytes
    pub memory_limit: usize,
    /// Maximum JS stack size in bytes
    pub max_stack_size: usize,
    /// Maximum single sleep duration in milliseconds
    pub max_sleep_ms: u64,
    /// Maximum time `wait_shared` blocks before failing with a timeout
    pub wait_shared_timeout_ms: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,              // 30 seconds
            memory_limit: 64 * 1024 * 1024,  // 64 MB
            max_stack_size: 1024 * 1024,     // 1 MB
            max_sleep_ms: 10_000,            // 10 seconds max sleep
            wait_shared_timeout_ms: 10_000,  // 10 seconds max wait
        }
    }
}

/// One script of a chain (collection, folder or request level)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptScope {
    pub scope: String,
    pub source: String,
}

impl ScriptScope {
    #[must_use]
    pub fn new(scope: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            source: source.into(),
        }
    }
}

/// Event emitted during script execution
#[derive(Debug, Clone)]
pub enum ScriptEvent {
    /// Script produced a log line
    Log { instance_id: InstanceId, entry: LogEntry },
    /// Script finished
    Finished { instance_id: InstanceId, status: ScriptStatus },
}

/// Script completion status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStatus {
    Success,
    Error { message: String },
    Cancelled,
    Timeout,
}

impl ScriptStatus {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<&Result<(), ScriptError>> for ScriptStatus {
    fn from(result: &Result<(), ScriptError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(ScriptError::Cancelled) => Self::Cancelled,
            Err(ScriptError::Timeout) => Self::Timeout,
            Err(e) => Self::Error {
                message: e.to_string(),
            },
        }
    }
}

/// Everything an instance recorded, read out by the host when it finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    pub instance_id: InstanceId,
    pub name: String,
    pub status: ScriptStatus,
    pub tests: TestReport,
    pub logs: Vec<LogEntry>,
    /// Environment as the script last saw it
    pub env: BTreeMap<String, String>,
    pub env_overrides: Vec<EnvOverride>,
    pub headers: Vec<HeaderAddition>,
    pub params: Vec<ParamAddition>,
}

impl InstanceReport {
    /// Why the instance stopped early, if it did
    #[must_use]
    pub fn abort_reason(&self) -> Option<String> {
        match &self.status {
            ScriptStatus::Success => None,
            ScriptStatus::Error { message } => Some(message.clone()),
            ScriptStatus::Cancelled => Some(ScriptError::Cancelled.to_string()),
            ScriptStatus::Timeout => Some(ScriptError::Timeout.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ScriptConfig::default();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.memory_limit, 64 * 1024 * 1024);
        assert_eq!(config.max_sleep_ms, 10_000);
        assert_eq!(config.wait_shared_timeout_ms, 10_000);
    }

    #[test]
    fn config_fills_missing_fields() {
        let config: ScriptConfig = serde_json::from_str(r#"{"timeout_ms": 500}"#).unwrap();
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.max_sleep_ms, 10_000);
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(
            BridgeError::UnknownOperation("x".into()).kind().as_str(),
            "UnknownOperation"
        );
        assert_eq!(BridgeError::Network("down".into()).kind().as_str(), "NetworkError");
        assert_eq!(BridgeError::Timeout("k".into()).kind(), ErrorKind::Timeout);
        assert_eq!(
            serde_json::to_value(ErrorKind::InvalidArgument).unwrap(),
            serde_json::json!("InvalidArgument")
        );
    }

    #[test]
    fn status_from_result() {
        assert_eq!(ScriptStatus::from(&Ok(())), ScriptStatus::Success);
        assert_eq!(ScriptStatus::from(&Err(ScriptError::Timeout)), ScriptStatus::Timeout);
        let status = ScriptStatus::from(&Err(ScriptError::JsError("boom".into())));
        assert_eq!(
            status,
            ScriptStatus::Error {
                message: "JavaScript error: boom".into()
            }
        );
    }
}

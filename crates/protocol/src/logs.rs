//! Script log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a script log line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// A single rendered log line produced while an instance ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub time: DateTime<Utc>,
    /// Script scope that produced the line (e.g. collection, folder, request)
    pub scope: String,
    pub message: String,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            time: Utc::now(),
            scope: scope.into(),
            message: message.into(),
        }
    }

    /// One-line rendering for plain-text output
    #[must_use]
    pub fn show(&self) -> String {
        format!(
            "{} {:?} [{}] {}",
            self.time.format("%H:%M:%S"),
            self.level,
            self.scope,
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_includes_scope_and_level() {
        let entry = LogEntry::new(LogLevel::Warn, "login", "token expired");
        let line = entry.show();
        assert!(line.contains("Warn"));
        assert!(line.contains("[login]"));
        assert!(line.ends_with("token expired"));
    }
}

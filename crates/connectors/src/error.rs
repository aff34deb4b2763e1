//! Connector error types

use thiserror::Error;

/// Errors raised by host collaborators
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Collaborator not available: {0}")]
    Unavailable(String),
}

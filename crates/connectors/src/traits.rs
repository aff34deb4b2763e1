//! Collaborator trait definitions

use async_trait::async_trait;
use hostbridge_protocol::{HttpRequestSpec, HttpResponse, TaggedWord};

use crate::ConnectorError;

/// Performs HTTP requests for scripts
///
/// Implementations return the raw response; decoding the body is the bridge's
/// concern, not the client's.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn perform(&self, request: HttpRequestSpec) -> Result<HttpResponse, ConnectorError>;
}

/// Text analysis used by the NLP helpers and `assert_nlp`
pub trait NlpEngine: Send + Sync {
    /// Top `k` keywords of `text`
    fn keywords(&self, text: &str, k: usize) -> Result<Vec<String>, ConnectorError>;

    /// Part-of-speech tags for each word of `text`
    fn tags(&self, text: &str) -> Result<Vec<TaggedWord>, ConnectorError>;

    /// Words of `text` whose tag is one of `tags`
    fn tag_filter(&self, text: &str, tags: &[String]) -> Result<Vec<String>, ConnectorError>;

    /// Similarity score of `a` and `b` in `[0, 1]`
    fn similarity(&self, a: &str, b: &str) -> Result<f64, ConnectorError>;
}

/// NLP engine for hosts that ship without one; every call fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNlpEngine;

impl NlpEngine for NoNlpEngine {
    fn keywords(&self, _text: &str, _k: usize) -> Result<Vec<String>, ConnectorError> {
        Err(ConnectorError::Unavailable("nlp".into()))
    }

    fn tags(&self, _text: &str) -> Result<Vec<TaggedWord>, ConnectorError> {
        Err(ConnectorError::Unavailable("nlp".into()))
    }

    fn tag_filter(&self, _text: &str, _tags: &[String]) -> Result<Vec<String>, ConnectorError> {
        Err(ConnectorError::Unavailable("nlp".into()))
    }

    fn similarity(&self, _a: &str, _b: &str) -> Result<f64, ConnectorError> {
        Err(ConnectorError::Unavailable("nlp".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_nlp_engine_reports_unavailable() {
        let engine = NoNlpEngine;
        assert!(matches!(
            engine.similarity("a", "b"),
            Err(ConnectorError::Unavailable(_))
        ));
        assert!(engine.keywords("a b c", 2).is_err());
    }
}

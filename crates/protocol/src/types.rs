//! Common types used across operations and reports

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a run (one test case, possibly many instances)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a single script instance within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of an ordered multimap (headers, query parameters)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub name: String,
    pub value: String,
}

impl KeyValue {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Header appended by a script; applied by the host after the instance completes
pub type HeaderAddition = KeyValue;

/// Query parameter appended by a script; applied by the host after the instance completes
pub type ParamAddition = KeyValue;

/// Environment write made by a script (last write per key wins)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvOverride {
    pub key: String,
    pub value: String,
}

/// A word annotated with its part-of-speech tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedWord {
    pub word: String,
    pub tag: String,
}

/// Request issued by a script through `fetch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    pub headers: Vec<KeyValue>,
    pub params: Vec<KeyValue>,
    pub body: String,
}

impl Default for HttpRequestSpec {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            url: String::new(),
            headers: Vec::new(),
            params: Vec::new(),
            body: String::new(),
        }
    }
}

impl HttpRequestSpec {
    /// Create a GET request for `url`
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Response as seen by a script
///
/// `json` holds the body decoded as structured data when the text happens to
/// parse; it is absent otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<KeyValue>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: u16, headers: Vec<KeyValue>, text: impl Into<String>) -> Self {
        Self {
            status,
            headers,
            text: text.into(),
            json: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_to_get() {
        let req: HttpRequestSpec = serde_json::from_str(r#"{"url":"http://localhost/a"}"#).unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.headers.is_empty());
        assert_eq!(req, HttpRequestSpec::get("http://localhost/a"));
    }

    #[test]
    fn response_omits_absent_json() {
        let resp = HttpResponse::new(200, vec![], "plain");
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("json").is_none());
        assert_eq!(json["text"], "plain");
    }
}

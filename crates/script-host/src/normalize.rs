//! Response normalization
//!
//! Scripts see a response as `{status, headers, text, json?}`. The body is
//! decoded opportunistically; a body that is not structured data simply has
//! no `json` field.

use hostbridge_protocol::HttpResponse;
use serde_json::Value;

/// Fill in the decoded body of `response`
#[must_use]
pub fn normalize_response(mut response: HttpResponse) -> HttpResponse {
    response.json = decode_body(&response.text);
    response
}

/// Decode `text` as structured data, if it is
#[must_use]
pub fn decode_body(text: &str) -> Option<Value> {
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, len = text.len(), "Response body left undecoded");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_protocol::KeyValue;
    use serde_json::json;

    #[test]
    fn structured_body_is_decoded() {
        let resp = normalize_response(HttpResponse::new(
            200,
            vec![KeyValue::new("content-type", "application/json")],
            r#"{"id": 1, "items": [1, 2]}"#,
        ));
        assert_eq!(resp.json, Some(json!({"id": 1, "items": [1, 2]})));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.len(), 1);
    }

    #[test]
    fn plain_body_has_no_decoded_field() {
        let resp = normalize_response(HttpResponse::new(500, vec![], "Internal Server Error"));
        assert_eq!(resp.json, None);
        assert_eq!(resp.text, "Internal Server Error");

        assert_eq!(decode_body(""), None);
        assert_eq!(decode_body("{broken"), None);
    }

    #[test]
    fn scalar_bodies_decode() {
        assert_eq!(decode_body("42"), Some(json!(42)));
        assert_eq!(decode_body("\"hi\""), Some(json!("hi")));
        assert_eq!(decode_body("null"), Some(Value::Null));
    }

    #[test]
    fn normalizing_twice_is_stable() {
        let once = normalize_response(HttpResponse::new(200, vec![], "[true]"));
        let twice = normalize_response(once.clone());
        assert_eq!(once, twice);
    }
}

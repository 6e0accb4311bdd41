//! # HTTP response parsing
//!
//! Strict JSON decoding for fetched payloads plus friendly hints for common
//! failure statuses.

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Return a user-friendly hint for common HTTP failure statuses.
///
/// # Example
/// ```rust
/// use stepwise_util::http::status_error_message;
///
/// assert!(status_error_message(401).unwrap().contains("Unauthorized"));
/// assert!(status_error_message(429).unwrap().contains("Too Many Requests"));
/// assert!(status_error_message(500).is_none());
/// ```
pub fn status_error_message(status_code: u16) -> Option<String> {
    match status_code {
        401 => Some("Unauthorized (401). Hint: supply an Authorization header in the step's init".into()),
        403 => Some("Forbidden (403). Hint: check the credentials attached to the request".into()),
        404 => Some("Not Found (404). Hint: verify the step's url".into()),
        429 => Some("Too Many Requests (429). Hint: lower the re-run frequency or raise the cache ttl".into()),
        _ => None,
    }
}

/// Parse HTTP response text into JSON, providing detailed errors on failure.
///
/// Any parsing error is decorated with the originating status code plus a
/// truncated, whitespace-collapsed preview of the body (up to 200 characters).
///
/// ```rust
/// use stepwise_util::http::parse_response_json_strict;
///
/// let value = parse_response_json_strict(r#"{"name": "demo"}"#, None).expect("valid json");
/// assert_eq!(value["name"], "demo");
///
/// let error = parse_response_json_strict("<html>oops</html>", None).expect_err("invalid json");
/// assert_eq!(error.body_preview(), "<html>oops</html>");
/// ```
pub fn parse_response_json_strict(text: &str, status: Option<StatusCode>) -> Result<Value, JsonParseError> {
    serde_json::from_str::<Value>(text).map_err(|error| {
        let status_note = status
            .map(|code| format!("status {code}"))
            .unwrap_or_else(|| "unknown status".to_string());
        let preview = truncate_response_preview(text, 200);

        JsonParseError::new(status_note, error, preview)
    })
}

fn truncate_response_preview(text: &str, limit: usize) -> String {
    if text.trim().is_empty() {
        return "<empty>".to_string();
    }

    let mut preview = String::new();
    for ch in text.chars() {
        if preview.len() >= limit {
            preview.push_str("...");
            break;
        }
        match ch {
            '\n' | '\r' | '\t' => {
                if !preview.ends_with(' ') {
                    preview.push(' ');
                }
            }
            _ => preview.push(ch),
        }
    }

    crate::redact_sensitive(preview.trim())
}

/// Error returned when strict JSON parsing of an HTTP response fails.
#[derive(Debug, Error)]
#[error("failed to parse JSON response ({status_note}): {source}. body preview: {body_preview}")]
pub struct JsonParseError {
    status_note: String,
    #[source]
    source: serde_json::Error,
    body_preview: String,
}

impl JsonParseError {
    pub fn new(status_note: String, source: serde_json::Error, body_preview: String) -> Self {
        Self {
            status_note,
            source,
            body_preview,
        }
    }

    /// Access the truncated response preview captured during parsing.
    pub fn body_preview(&self) -> &str {
        &self.body_preview
    }
}

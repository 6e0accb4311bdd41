pub mod http;
pub mod path_processing;

pub use http::{FetchError, HttpJsonClient, JsonParseError, parse_response_json_strict};
pub use path_processing::expand_tilde;

use once_cell::sync::Lazy;
use regex::Regex;

static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization:\s*)(.+)",
        r"(?i)([A-Z0-9_]*?(?:KEY|TOKEN|SECRET|PASSWORD)=)([^\s&]+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("redaction pattern compiles"))
    .collect()
});

/// Redacts values that look like secrets in a string.
///
/// Used before URLs, headers, or response previews are written to logs or
/// surfaced in error messages.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in SENSITIVE_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |caps: &regex::Captures| {
                let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{}<redacted>", prefix)
            })
            .to_string();
    }
    redacted
}

//! Fetch requests understood by the cache-backed async source.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

const SENSITIVE_HEADERS: &[&str] = &["authorization", "proxy-authorization", "cookie"];
const SENSITIVE_FRAGMENTS: &[&str] = &["token", "secret", "key", "password"];

/// Whether a lower-cased header or query parameter name carries credentials.
fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS.contains(&name) || SENSITIVE_FRAGMENTS.iter().any(|fragment| name.contains(fragment))
}

/// `raw` with credential query parameter values replaced by digests.
fn keyed_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if !pairs.iter().any(|(name, _)| is_sensitive_header(&name.to_ascii_lowercase())) {
        return raw.to_string();
    }
    url.query_pairs_mut().clear().extend_pairs(pairs.iter().map(|(name, value)| {
        let value = if is_sensitive_header(&name.to_ascii_lowercase()) { digest(value) } else { value.clone() };
        (name.clone(), value)
    }));
    url.to_string()
}

/// Short SHA-256 digest standing in for a credential inside a cache key.
fn digest(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    format!("sha256:{}", &hex[..16])
}

/// Optional request parameters accompanying a URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestInit {
    /// HTTP method; defaults to `GET` when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Extra request headers in authoring order.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Optional JSON body.
    #[serde(default)]
    pub body: Option<Value>,
}

impl RequestInit {
    /// Upper-cased method, `GET` when unset or blank.
    pub fn method(&self) -> String {
        self.method
            .as_deref()
            .map(str::trim)
            .filter(|method| !method.is_empty())
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| "GET".to_string())
    }
}

/// A URL plus its init parameters; the identity of one cache entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub init: RequestInit,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            init: RequestInit::default(),
        }
    }

    pub fn with_init(mut self, init: RequestInit) -> Self {
        self.init = init;
        self
    }

    /// Stable cache key derived from the method, URL, headers, and body.
    ///
    /// Header names are compared case-insensitively and their authoring order
    /// does not affect the key. Values of credential headers and query
    /// parameters (`Authorization`, `Cookie`, anything naming a token, secret,
    /// key, or password) appear only as a digest, so keys are safe to log and
    /// to carry in events and errors.
    pub fn cache_key(&self) -> String {
        let mut key = format!("{} {}", self.init.method(), keyed_url(self.url.trim()));

        if !self.init.headers.is_empty() {
            let headers: BTreeMap<String, String> = self
                .init
                .headers
                .iter()
                .map(|(name, value)| {
                    let name = name.trim().to_ascii_lowercase();
                    let value = if is_sensitive_header(&name) { digest(value) } else { value.clone() };
                    (name, value)
                })
                .collect();
            let rendered: Vec<String> = headers.iter().map(|(name, value)| format!("{name}={value}")).collect();
            key.push_str(" [");
            key.push_str(&rendered.join(";"));
            key.push(']');
        }

        if let Some(body) = &self.init.body {
            key.push(' ');
            key.push_str(&body.to_string());
        }

        key
    }
}

//! HTTP JSON fetching shared by the engine's async source and the CLI.
//!
//! [`HttpJsonClient`] wraps a preconfigured `reqwest::Client` and turns a
//! [`FetchRequest`] into a parsed JSON value. Failures are reported as
//! [`FetchError`] with secrets redacted from URLs.

use std::str::FromStr;
use std::time::{Duration, Instant};

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::Value;
use stepwise_types::FetchRequest;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::parser::{JsonParseError, parse_response_json_strict, status_error_message};
use crate::redact_sensitive;

/// Hostnames allowed to use plain `http`.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

/// Errors raised while fetching a JSON resource.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),
    #[error("invalid header '{name}'")]
    InvalidHeader { name: String },
    #[error("could not build the HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("network error requesting {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP {status} from {url}{}", .hint.as_deref().map(|hint| format!(": {hint}")).unwrap_or_default())]
    Status { status: u16, url: String, hint: Option<String> },
    #[error(transparent)]
    Parse(#[from] JsonParseError),
}

/// Thin wrapper around a configured `reqwest::Client` for JSON resources.
#[derive(Debug, Clone)]
pub struct HttpJsonClient {
    http: Client,
    user_agent: String,
}

impl HttpJsonClient {
    /// Build a client with JSON accept headers and the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            http,
            user_agent: format!("stepwise/{}; {}", env!("CARGO_PKG_VERSION"), std::env::consts::OS),
        })
    }

    /// Perform the request and parse the response body as JSON.
    ///
    /// Empty bodies resolve to `Value::Null`. Non-success statuses become
    /// [`FetchError::Status`] carrying a hint for well-known codes.
    pub async fn fetch_json(&self, request: &FetchRequest) -> Result<Value, FetchError> {
        let start = Instant::now();
        let url = validate_url(&request.url)?;
        let safe_url = redact_sensitive(url.as_str());
        let method_name = request.init.method();
        let method = Method::from_str(&method_name).map_err(|_| FetchError::InvalidMethod(method_name.clone()))?;

        let mut builder = self
            .http
            .request(method.clone(), url)
            .header(header::USER_AGENT, &self.user_agent);
        for (name, value) in &request.init.headers {
            let header_name = HeaderName::from_str(name.trim()).map_err(|_| FetchError::InvalidHeader { name: name.clone() })?;
            let header_value = HeaderValue::from_str(value).map_err(|_| FetchError::InvalidHeader { name: name.clone() })?;
            builder = builder.header(header_name, header_value);
        }
        if let Some(body) = &request.init.body {
            builder = builder.json(body);
        }

        debug!(method = %method, url = %safe_url, header_count = request.init.headers.len(), "http fetch started");
        let response = builder.send().await.map_err(|source| FetchError::Network {
            url: safe_url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                method = %method,
                url = %safe_url,
                status = %status,
                duration_ms = start.elapsed().as_millis(),
                "http fetch failed"
            );
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: safe_url,
                hint: status_error_message(status.as_u16()),
            });
        }

        let body_text = response.text().await.map_err(|source| FetchError::Network {
            url: safe_url.clone(),
            source,
        })?;
        if body_text.trim().is_empty() {
            debug!(url = %safe_url, status = %status, "http fetch completed with empty response");
            return Ok(Value::Null);
        }

        let parsed = parse_response_json_strict(&body_text, Some(status))?;
        debug!(
            method = %method,
            url = %safe_url,
            status = %status,
            duration_ms = start.elapsed().as_millis(),
            "http fetch completed"
        );
        Ok(parsed)
    }
}

/// Validate that a URL is acceptable for fetching.
///
/// Rules:
/// - the URL must parse and include a host
/// - `localhost` or `127.0.0.1`: `http` or `https`
/// - otherwise: `https` only
pub fn validate_url(raw: &str) -> Result<Url, FetchError> {
    let invalid = |reason: String| FetchError::InvalidUrl {
        url: redact_sensitive(raw),
        reason,
    };
    let parsed = Url::parse(raw.trim()).map_err(|error| invalid(error.to_string()))?;
    let host_name = parsed.host_str().ok_or_else(|| invalid("missing host".into()))?.to_string();

    let is_local = LOCALHOST_DOMAINS
        .iter()
        .any(|&allowed| host_name.eq_ignore_ascii_case(allowed));
    let scheme = parsed.scheme();
    if scheme == "https" || (scheme == "http" && is_local) {
        return Ok(parsed);
    }
    Err(invalid(format!("scheme '{scheme}://' is not allowed for host '{host_name}'")))
}

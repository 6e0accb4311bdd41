//! Built-in resolvers.
//!
//! | kind | parameters | result |
//! |---|---|---|
//! | `value` | `value` | the literal `value` (`null` when absent) |
//! | `identity` | | `previous` unchanged |
//! | `property` | `path`, optional `from` | the value at `path` inside `from`, or inside `previous` |
//! | `list` | optional `path`, optional `items` | each element of `items` (or `previous`) narrowed to `path` |
//! | `fetch` | `url`, optional `init`, optional `placeholder` | the JSON body served by the async source |
//!
//! All of them are registered through [`Resolver::enhanced`], so they accept
//! `dependencies` and `requiredArgs`.

use serde::Deserialize;
use serde_json::{Value, json};
use stepwise_types::{FetchRequest, RequestInit};
use tracing::debug;

use crate::{
    continuation::{Outcome, Suspension},
    error::PipelineError,
    registry::Resolver,
    source::CacheStatus,
};

/// Every built-in resolver, in a fixed order.
pub fn builtin_resolvers() -> Vec<Resolver> {
    vec![value(), identity(), property(), list(), fetch()]
}

pub fn value() -> Resolver {
    Resolver::enhanced("value", |_previous, current, next| {
        next.proceed(current.property("value").cloned().unwrap_or(Value::Null))
    })
}

pub fn identity() -> Resolver {
    Resolver::enhanced("identity", |previous, _current, next| next.proceed(previous))
}

#[derive(Debug, Deserialize)]
struct PropertyParams {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    from: Option<Value>,
}

pub fn property() -> Resolver {
    Resolver::typed("property", |previous, params: PropertyParams, _current, next| {
        let target = params.from.as_ref().unwrap_or(&previous);
        let selected = select_path(target, params.path.as_deref()).unwrap_or(Value::Null);
        next.proceed(selected)
    })
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    items: Option<Value>,
}

pub fn list() -> Resolver {
    Resolver::typed("list", |previous, params: ListParams, current, next| {
        let items = params.items.unwrap_or(previous);
        let mapped = match items {
            Value::Null => Value::Null,
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| select_path(item, params.path.as_deref()).unwrap_or(Value::Null))
                    .collect(),
            ),
            other => {
                return Err(PipelineError::handler(
                    current.kind.as_str(),
                    format!("expected an array, got {}", json_type_name(&other)),
                ));
            }
        };
        next.proceed(mapped)
    })
}

#[derive(Debug, Deserialize)]
struct FetchParams {
    url: String,
    #[serde(default)]
    init: RequestInit,
    #[serde(default)]
    placeholder: Option<Value>,
}

/// Serve `url` from the async source, suspending while it is in flight.
pub fn fetch() -> Resolver {
    Resolver::typed("fetch", |_previous, params: FetchParams, _current, next| {
        let source = next.scope().source().ok_or_else(|| PipelineError::configuration("source"))?;
        let request = FetchRequest::new(params.url).with_init(params.init);
        match source.request(&request) {
            CacheStatus::Complete(value) => next.proceed(value),
            CacheStatus::Pending => {
                let key = request.cache_key();
                debug!(key = %key, "fetch pending; suspending");
                let placeholder = params.placeholder.unwrap_or_else(|| json!({ "loading": true }));
                Outcome::suspend(Suspension::awaiting(key).with_placeholder(placeholder))
            }
            CacheStatus::Failed(message) => Err(PipelineError::AsyncSource {
                key: request.cache_key(),
                message,
            }),
        }
    })
}

/// Walk a dotted path such as `items[0].name` into `value`.
///
/// `None` or a blank path selects the whole value. Missing keys or indices
/// yield `None`.
pub fn select_path(value: &Value, path: Option<&str>) -> Option<Value> {
    let Some(path) = path.map(str::trim).filter(|path| !path.is_empty()) else {
        return Some(value.clone());
    };

    let mut current = value;
    for segment in path.split('.').filter(|segment| !segment.is_empty()) {
        let (key, indices) = split_indices(segment);
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indices {
            current = current.get(index)?;
        }
    }
    Some(current.clone())
}

fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let Some(open) = segment.find('[') else {
        return (segment, Vec::new());
    };
    let indices = segment[open..]
        .split('[')
        .filter_map(|part| part.strip_suffix(']'))
        .filter_map(|digits| digits.parse::<usize>().ok())
        .collect();
    (&segment[..open], indices)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! Pipeline error taxonomy.

use serde_json::{Value, json};
use thiserror::Error;

/// Errors produced while configuring or executing a pipeline.
///
/// Handlers return these through [`StepResult`](crate::StepResult); nothing
/// crosses a handler boundary by unwinding.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// A required top-level field was not provided at all.
    #[error("configuration error: missing required field '{field}'")]
    Configuration { field: String },
    /// No resolver is registered for the step's kind and the registry fails fast.
    #[error("no resolver registered for kind '{kind}'")]
    UnresolvedKind { kind: String },
    /// The step's properties could not be decoded into the resolver's payload.
    #[error("invalid parameters for '{kind}' step: {message}")]
    InvalidStep { kind: String, message: String },
    /// A handler reported a failure.
    #[error("'{kind}' handler failed: {message}")]
    Handler { kind: String, message: String },
    /// The cache-backed source settled the entry for `key` as failed.
    #[error("async source failed for '{key}': {message}")]
    AsyncSource { key: String, message: String },
    /// Nested dependency resolution went deeper than the configured limit.
    #[error("dependency depth {depth} exceeds the limit of {limit} (via {path})")]
    CyclicDependency { depth: usize, limit: usize, path: String },
}

impl PipelineError {
    pub fn configuration(field: impl Into<String>) -> Self {
        Self::Configuration { field: field.into() }
    }

    pub fn handler(kind: impl Into<String>, message: impl ToString) -> Self {
        Self::Handler {
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    /// Short machine-readable tag for the variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::UnresolvedKind { .. } => "unresolved_kind",
            Self::InvalidStep { .. } => "invalid_step",
            Self::Handler { .. } => "handler",
            Self::AsyncSource { .. } => "async_source",
            Self::CyclicDependency { .. } => "cyclic_dependency",
        }
    }

    /// Fatal errors abort the whole invocation regardless of the error policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::UnresolvedKind { .. } | Self::CyclicDependency { .. }
        )
    }

    /// Distinguished value merged in place of an isolated dependency result.
    pub fn to_value(&self) -> Value {
        json!({ "$error": { "kind": self.tag(), "message": self.to_string() } })
    }
}

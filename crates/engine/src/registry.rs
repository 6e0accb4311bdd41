//! Resolver registry: maps a step's `kind` to its handler.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use stepwise_types::Step;
use tracing::warn;

use crate::{
    config::UnknownKindPolicy,
    continuation::{Next, StepResult},
    enhancer::enhance,
    error::PipelineError,
};

/// A three-argument handler: `(previous, current, next)`.
pub type Handler = Arc<dyn Fn(Value, &Step, Next<'_>) -> StepResult + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(function: F) -> Handler
where
    F: Fn(Value, &Step, Next<'_>) -> StepResult + Send + Sync + 'static,
{
    Arc::new(function)
}

/// A handler bound to the `kind` it resolves.
#[derive(Clone)]
pub struct Resolver {
    pub kind: String,
    pub handler: Handler,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl Resolver {
    /// Register a plain handler with no enhancers applied.
    pub fn new<F>(kind: impl Into<String>, function: F) -> Self
    where
        F: Fn(Value, &Step, Next<'_>) -> StepResult + Send + Sync + 'static,
    {
        Self::from_handler(kind, handler(function))
    }

    pub fn from_handler(kind: impl Into<String>, handler: Handler) -> Self {
        Self {
            kind: kind.into(),
            handler,
        }
    }

    /// Register a handler wrapped with dependency resolution and the
    /// required-argument gate.
    pub fn enhanced<F>(kind: impl Into<String>, function: F) -> Self
    where
        F: Fn(Value, &Step, Next<'_>) -> StepResult + Send + Sync + 'static,
    {
        Self::from_handler(kind, enhance(handler(function)))
    }

    /// Register an enhanced handler over a typed payload decoded from the
    /// step's properties. Decoding happens after dependencies are merged, so
    /// payload fields may be filled by dependency results.
    pub fn typed<P, F>(kind: impl Into<String>, function: F) -> Self
    where
        P: DeserializeOwned,
        F: Fn(Value, P, &Step, Next<'_>) -> StepResult + Send + Sync + 'static,
    {
        let kind = kind.into();
        let payload_kind = kind.clone();
        Self::enhanced(kind, move |previous, current, next| {
            let payload = current.payload::<P>().map_err(|error| PipelineError::InvalidStep {
                kind: payload_kind.clone(),
                message: error.to_string(),
            })?;
            function(previous, payload, current, next)
        })
    }
}

/// Lookup table from `kind` to handler.
///
/// When a kind is registered more than once the first registration wins and a
/// warning is logged.
pub struct ResolverRegistry {
    handlers: IndexMap<String, Handler>,
    unknown_kind: UnknownKindPolicy,
    passthrough: Handler,
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self {
            handlers: IndexMap::new(),
            unknown_kind: UnknownKindPolicy::default(),
            passthrough: handler(|previous, _current, next| next.proceed(previous)),
        }
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .field("unknown_kind", &self.unknown_kind)
            .finish()
    }
}

impl ResolverRegistry {
    pub fn new(resolvers: impl IntoIterator<Item = Resolver>) -> Self {
        let mut registry = Self::default();
        for resolver in resolvers {
            registry.register(resolver);
        }
        registry
    }

    pub fn with_unknown_kind(mut self, policy: UnknownKindPolicy) -> Self {
        self.unknown_kind = policy;
        self
    }

    /// Add a resolver. Returns `false` when the kind was already registered.
    pub fn register(&mut self, resolver: Resolver) -> bool {
        if self.handlers.contains_key(&resolver.kind) {
            warn!(kind = %resolver.kind, "duplicate resolver kind ignored; first registration wins");
            return false;
        }
        self.handlers.insert(resolver.kind, resolver.handler);
        true
    }

    /// Handler for `kind`, honoring the unknown-kind policy.
    pub fn lookup(&self, kind: &str) -> Result<&Handler, PipelineError> {
        if let Some(handler) = self.handlers.get(kind) {
            return Ok(handler);
        }
        match self.unknown_kind {
            UnknownKindPolicy::Fail => Err(PipelineError::UnresolvedKind { kind: kind.to_string() }),
            UnknownKindPolicy::Passthrough => Ok(&self.passthrough),
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn unknown_kind(&self) -> UnknownKindPolicy {
        self.unknown_kind
    }

    /// Registered kinds in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

//! The continuation protocol every handler honors.
//!
//! A handler receives `(previous, current, next)`. It either continues the
//! chain by consuming `next` with [`Next::proceed`], or stops it by returning
//! [`Outcome::Suspended`]. `Next` is move-only, so a handler cannot continue
//! twice, and [`Completion`] can only be minted by the terminal continuation,
//! so a handler cannot report completion without continuing.

use serde_json::Value;
use stepwise_types::Step;
use tracing::debug;

use crate::{
    config::{EngineConfig, MAX_DEPTH_LIMIT},
    error::PipelineError,
    pipeline::Pipeline,
    registry::ResolverRegistry,
    source::CachedSource,
};

/// Result of invoking a handler or a whole pipeline.
pub type StepResult = Result<Outcome, PipelineError>;

/// How a pipeline invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The terminal continuation ran and produced a value.
    Done(Completion),
    /// A handler stopped the chain without continuing.
    Suspended(Suspension),
}

impl Outcome {
    /// Convenience for handlers that stop the chain.
    pub fn suspend(suspension: Suspension) -> StepResult {
        Ok(Self::Suspended(suspension))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    /// Final value when the chain completed.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Done(completion) => Some(completion.value()),
            Self::Suspended(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Done(completion) => Some(completion.into_value()),
            Self::Suspended(_) => None,
        }
    }

    pub fn suspension(&self) -> Option<&Suspension> {
        match self {
            Self::Done(_) => None,
            Self::Suspended(suspension) => Some(suspension),
        }
    }
}

/// Proof that the terminal continuation ran. Only the engine can create one.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    value: Value,
}

impl Completion {
    pub(crate) fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Why a chain stopped early.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Suspension {
    /// Cache keys whose settlement should trigger a re-run.
    pub awaiting: Vec<String>,
    /// Value to show while waiting, such as a loading indicator.
    pub placeholder: Option<Value>,
}

impl Suspension {
    /// Suspension waiting on a single cache key.
    pub fn awaiting(key: impl Into<String>) -> Self {
        Self {
            awaiting: vec![key.into()],
            placeholder: None,
        }
    }

    pub fn with_placeholder(mut self, placeholder: Value) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    /// Fold another suspension into this one, keeping the first placeholder.
    pub fn merge(&mut self, other: Suspension) {
        for key in other.awaiting {
            if !self.awaiting.contains(&key) {
                self.awaiting.push(key);
            }
        }
        if self.placeholder.is_none() {
            self.placeholder = other.placeholder;
        }
    }
}

pub(crate) type Continuation<'a> = dyn Fn(Value) -> StepResult + 'a;

/// "The rest of the pipeline" as seen by one handler.
pub struct Next<'a> {
    continuation: &'a Continuation<'a>,
    scope: &'a Scope<'a>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(continuation: &'a Continuation<'a>, scope: &'a Scope<'a>) -> Self {
        Self { continuation, scope }
    }

    /// Hand `value` to the next step as its `previous` and return what the
    /// remainder of the chain produced.
    pub fn proceed(self, value: Value) -> StepResult {
        (self.continuation)(value)
    }

    /// Invocation context for handlers that need the registry or async source.
    pub fn scope(&self) -> &'a Scope<'a> {
        self.scope
    }
}

/// Invocation context threaded through a pipeline and its nested dependencies.
pub struct Scope<'a> {
    registry: &'a ResolverRegistry,
    config: &'a EngineConfig,
    source: Option<&'a CachedSource>,
    depth: usize,
    trail: Vec<String>,
}

impl<'a> Scope<'a> {
    /// Top-level scope for one invocation.
    pub fn root(registry: &'a ResolverRegistry, config: &'a EngineConfig, source: Option<&'a CachedSource>) -> Self {
        Self {
            registry,
            config,
            source,
            depth: 0,
            trail: Vec::new(),
        }
    }

    pub fn registry(&self) -> &'a ResolverRegistry {
        self.registry
    }

    pub fn config(&self) -> &'a EngineConfig {
        self.config
    }

    /// The cache-backed async source, when the caller supplied one.
    pub fn source(&self) -> Option<&'a CachedSource> {
        self.source
    }

    /// Nesting depth; zero for the top-level pipeline.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Run `steps` as a sub-pipeline owned by `owner`, seeded with `null` and
    /// ending in the identity continuation.
    pub fn resolve_nested(&self, owner: &Step, steps: &[Step]) -> StepResult {
        let child = self.descend(owner)?;
        debug!(owner = %owner.kind, depth = child.depth, steps = steps.len(), "resolving nested pipeline");
        Pipeline::new(steps).invoke(&child, Value::Null)
    }

    fn descend(&self, owner: &Step) -> Result<Scope<'a>, PipelineError> {
        let depth = self.depth + 1;
        let mut trail = self.trail.clone();
        trail.push(owner.kind.clone());
        let limit = self.config.max_depth.min(MAX_DEPTH_LIMIT);
        if depth > limit {
            return Err(PipelineError::CyclicDependency {
                depth,
                limit,
                path: trail.join(" -> "),
            });
        }
        Ok(Scope {
            registry: self.registry,
            config: self.config,
            source: self.source,
            depth,
            trail,
        })
    }
}

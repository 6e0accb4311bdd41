//! Entry points for executing a definition against a set of resolvers.

use std::sync::Arc;

use serde_json::Value;
use stepwise_types::{PipelineDocument, Step};
use tracing::{debug, info};

use crate::{
    config::EngineConfig,
    continuation::{Outcome, Scope, StepResult},
    error::PipelineError,
    pipeline::{Pipeline, Render},
    registry::{Resolver, ResolverRegistry},
    source::CachedSource,
};

/// A registry, its configuration, and an optional async source, reusable
/// across invocations.
#[derive(Debug)]
pub struct Engine {
    registry: ResolverRegistry,
    config: EngineConfig,
    source: Option<CachedSource>,
}

impl Engine {
    pub fn new(resolvers: impl IntoIterator<Item = Resolver>, config: EngineConfig) -> Self {
        let registry = ResolverRegistry::new(resolvers).with_unknown_kind(config.unknown_kind);
        Self {
            registry,
            config,
            source: None,
        }
    }

    pub fn with_source(mut self, source: CachedSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn registry(&self) -> &ResolverRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> Option<&CachedSource> {
        self.source.as_ref()
    }

    /// Invoke `definition` once, with `seed` as the first `previous`.
    pub fn execute(&self, definition: &[Step], seed: Value, render: Option<&Render>) -> StepResult {
        self.execute_with_source(self.source.as_ref(), definition, seed, render)
    }

    /// Like [`Engine::execute`], reading async resources through `source`
    /// instead of the engine's own, typically a [`CachedSource::leased`] view.
    pub fn execute_with_source(
        &self,
        source: Option<&CachedSource>,
        definition: &[Step],
        seed: Value,
        render: Option<&Render>,
    ) -> StepResult {
        let scope = Scope::root(&self.registry, &self.config, source);
        debug!(steps = definition.len(), "pipeline invocation started");
        let result = Pipeline::new(definition).with_render(render).invoke(&scope, seed);
        match &result {
            Ok(Outcome::Done(_)) => debug!("pipeline invocation completed"),
            Ok(Outcome::Suspended(suspension)) => {
                debug!(awaiting = ?suspension.awaiting, "pipeline invocation suspended")
            }
            Err(error) => debug!(error = %error, "pipeline invocation failed"),
        }
        result
    }
}

/// Everything a single [`run`] needs.
#[derive(Clone)]
pub struct RunConfig {
    pub definition: Vec<Step>,
    pub resolvers: Vec<Resolver>,
    pub render: Option<Arc<Render>>,
    pub seed: Value,
    pub source: Option<CachedSource>,
    pub engine: EngineConfig,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Build from a parsed document. A document without `definition` is a
    /// configuration error.
    pub fn from_document(document: PipelineDocument, resolvers: Vec<Resolver>) -> Result<Self, PipelineError> {
        let mut builder = Self::builder().resolvers(resolvers).seed(document.seed);
        if let Some(definition) = document.definition {
            builder = builder.definition(definition);
        }
        builder.build()
    }
}

/// Builder that distinguishes "not provided" from "empty" for the required
/// fields.
#[derive(Default)]
pub struct RunConfigBuilder {
    definition: Option<Vec<Step>>,
    resolvers: Option<Vec<Resolver>>,
    render: Option<Arc<Render>>,
    seed: Option<Value>,
    source: Option<CachedSource>,
    engine: Option<EngineConfig>,
}

impl RunConfigBuilder {
    pub fn definition(mut self, definition: Vec<Step>) -> Self {
        self.definition = Some(definition);
        self
    }

    pub fn resolvers(mut self, resolvers: impl IntoIterator<Item = Resolver>) -> Self {
        self.resolvers = Some(resolvers.into_iter().collect());
        self
    }

    pub fn render<F>(mut self, render: F) -> Self
    where
        F: Fn(Value) -> Result<Value, PipelineError> + Send + Sync + 'static,
    {
        self.render = Some(Arc::new(render));
        self
    }

    pub fn seed(mut self, seed: Value) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn source(mut self, source: CachedSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Fails with [`PipelineError::Configuration`] when `definition` or
    /// `resolvers` was never supplied.
    pub fn build(self) -> Result<RunConfig, PipelineError> {
        let definition = self.definition.ok_or_else(|| PipelineError::configuration("definition"))?;
        let resolvers = self.resolvers.ok_or_else(|| PipelineError::configuration("resolvers"))?;
        Ok(RunConfig {
            definition,
            resolvers,
            render: self.render,
            seed: self.seed.unwrap_or(Value::Null),
            source: self.source,
            engine: self.engine.unwrap_or_default(),
        })
    }
}

/// Build a registry from `config.resolvers` and invoke the definition once.
pub fn run(config: &RunConfig) -> StepResult {
    info!(
        steps = config.definition.len(),
        resolvers = config.resolvers.len(),
        "running pipeline"
    );
    let mut engine = Engine::new(config.resolvers.iter().cloned(), config.engine.clone());
    if let Some(source) = &config.source {
        engine = engine.with_source(source.clone());
    }
    engine.execute(&config.definition, config.seed.clone(), config.render.as_deref())
}

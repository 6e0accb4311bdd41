//! # Stepwise Engine
//!
//! Resolves a declarative list of steps into a single value by threading each
//! step through the handler registered for its `kind`, passing an accumulated
//! value forward in continuation-passing style.
//!
//! ## Key Features
//!
//! - **Continuation protocol**: handlers receive `(previous, current, next)` and
//!   either continue with [`Next::proceed`] or stop with [`Outcome::Suspended`]
//! - **Dependencies**: steps can declare nested sub-pipelines whose results are
//!   merged into the step before its handler runs
//! - **Required-argument gate**: handlers are skipped until their inputs exist
//! - **Async source**: a keyed cache with in-flight de-duplication, plus a
//!   [`PipelineDriver`] that re-runs suspended pipelines as entries settle
//!
//! ## Usage
//!
//! ```rust
//! use serde_json::json;
//! use stepwise_engine::{RunConfig, builtin_resolvers, parse_pipeline_file, run};
//!
//! let temp_dir = tempfile::tempdir()?;
//! let path = temp_dir.path().join("pipeline.yaml");
//! std::fs::write(&path, r#"
//! definition:
//!   - kind: value
//!     value: { owner: { email: "dev@example.com" } }
//!   - kind: property
//!     path: owner.email
//! "#)?;
//!
//! let document = parse_pipeline_file(&path)?;
//! let config = RunConfig::from_document(document, builtin_resolvers())?;
//! let outcome = run(&config)?;
//! assert_eq!(outcome.into_value(), Some(json!("dev@example.com")));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`registry`**: `kind` to handler lookup and the unknown-kind policy
//! - **`pipeline`**: right-to-left composition of steps into one chain
//! - **`continuation`**: `Next`, `Outcome`, and the invocation `Scope`
//! - **`enhancer`**: dependency resolution and the required-argument gate
//! - **`source`**: the cache-backed async source and its fetchers
//! - **`driver`**: the generation-tagged re-run loop
//! - **`resolvers`**: built-in resolvers
//! - **`check`**: static validation of definitions

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

pub mod check;
pub mod config;
pub mod continuation;
pub mod driver;
pub mod enhancer;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod resolvers;
pub mod run;
pub mod source;

pub use check::{CheckIssue, Severity, check_definition};
pub use config::{CacheConfig, ConfigError, EngineConfig, ErrorPolicy, UnknownKindPolicy};
pub use continuation::{Completion, Next, Outcome, Scope, StepResult, Suspension};
pub use driver::PipelineDriver;
pub use enhancer::{enhance, require_args, with_dependencies};
pub use error::PipelineError;
pub use pipeline::{Pipeline, Render};
pub use registry::{Handler, Resolver, ResolverRegistry, handler};
pub use resolvers::builtin_resolvers;
pub use run::{Engine, RunConfig, RunConfigBuilder, run};
pub use source::{CacheStatus, CachedSource, HttpFetcher, JsonFetcher};
pub use stepwise_types::{
    Dependency, DriverControl, DriverEvent, DriverStatus, FetchRequest, PipelineDocument, RequestInit, SourceEvent, Step,
};

/// Loads a pipeline document from the filesystem.
///
/// Files ending in `.json` are parsed as JSON; everything else as YAML, which
/// also accepts JSON content. Besides the `definition:` mapping form, a bare
/// sequence of steps is accepted as the definition.
///
/// A document without a `definition` parses successfully; turning it into a
/// [`RunConfig`] reports the missing field.
pub fn parse_pipeline_file(file_path: impl AsRef<Path>) -> Result<PipelineDocument> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read pipeline file: {}", file_path.display()))?;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DocumentShape {
        Steps(Vec<Step>),
        Document(PipelineDocument),
    }

    let is_json = file_path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    let shape: DocumentShape = if is_json {
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON pipeline: {}", file_path.display()))?
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML pipeline: {}", file_path.display()))?
    };

    Ok(match shape {
        DocumentShape::Steps(definition) => PipelineDocument {
            definition: Some(definition),
            ..Default::default()
        },
        DocumentShape::Document(document) => document,
    })
}

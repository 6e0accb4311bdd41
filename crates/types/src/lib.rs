//! Shared, serializable types for Stepwise pipelines.
//!
//! Everything in this crate is plain data: definitions authored in YAML or
//! JSON, fetch requests keyed into the cache, and the events exchanged between
//! the async source, the re-run driver, and its callers. No engine handles or
//! functions live here so definitions can be stored and transmitted freely.

pub mod events;
pub mod fetch;
pub mod step;

pub use events::{DriverControl, DriverEvent, DriverStatus, SourceEvent};
pub use fetch::{FetchRequest, RequestInit};
pub use step::{Dependency, PipelineDocument, Step};

//! Events exchanged between the async source, the re-run driver, and callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::Step;

/// Published by the cache-backed source when an entry settles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceEvent {
    /// The entry for `key` completed with a value.
    Resolved { key: String },
    /// The entry for `key` failed; dependents will observe the failure on re-run.
    Failed { key: String, message: String },
}

impl SourceEvent {
    /// Cache key the event refers to.
    pub fn key(&self) -> &str {
        match self {
            Self::Resolved { key } | Self::Failed { key, .. } => key,
        }
    }
}

/// Terminal status reported by a driver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    /// The pipeline reached its terminal continuation.
    Completed,
    /// A run failed with a pipeline error.
    Failed,
    /// The caller canceled the driver before completion.
    Canceled,
}

/// Lifecycle events emitted by a pipeline driver. Every event carries the
/// generation of the run that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverEvent {
    /// A (re-)run started.
    RunStarted { generation: u64, at: DateTime<Utc> },
    /// The pipeline stopped early and is waiting on the listed cache keys.
    Suspended {
        generation: u64,
        awaiting: Vec<String>,
        placeholder: Option<Value>,
    },
    /// The pipeline produced its final value.
    Rendered { generation: u64, value: Value },
    /// The run failed.
    Failed { generation: u64, error: String },
    /// A source completion arrived for a key the current run is not waiting on.
    StaleDiscarded { generation: u64, key: String },
    /// The driver stopped.
    Finished {
        generation: u64,
        status: DriverStatus,
        finished_at: DateTime<Utc>,
    },
}

impl DriverEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::RunStarted { generation, .. }
            | Self::Suspended { generation, .. }
            | Self::Rendered { generation, .. }
            | Self::Failed { generation, .. }
            | Self::StaleDiscarded { generation, .. }
            | Self::Finished { generation, .. } => *generation,
        }
    }
}

/// Commands a caller can send to a running driver.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverControl {
    /// Supersede the current run with a new definition.
    Replace(Vec<Step>),
    /// Re-run the current definition under a new generation.
    Rerun,
    /// Stop the driver.
    Cancel,
}

//! Re-run loop for pipelines that suspend on the async source.
//!
//! [`PipelineDriver::drive`] invokes the pipeline, reports the outcome as
//! [`DriverEvent`]s, and when the run suspends waits for the awaited cache keys
//! to settle before running again under the next generation. Control messages
//! supersede the current run. A settlement for a key the current run is not
//! waiting on is reported as stale and otherwise ignored; the cache keeps the
//! value either way.
//!
//! Runs read the cache through a leased view, so every entry the current
//! definition has touched stays resident until the definition is replaced or
//! the driver finishes.

use std::{collections::HashSet, future, sync::Arc};

use chrono::Utc;
use serde_json::Value;
use stepwise_types::{DriverControl, DriverEvent, DriverStatus, SourceEvent, Step};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc::{UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, info, warn};

use crate::{continuation::Outcome, pipeline::Render, run::Engine, source::CachedSource};

const DEFAULT_MAX_RUNS: u64 = 64;

/// Owns a definition and re-runs it as its async dependencies settle.
pub struct PipelineDriver {
    engine: Arc<Engine>,
    definition: Vec<Step>,
    seed: Value,
    render: Option<Arc<Render>>,
    max_runs: u64,
    keep_alive: bool,
    lease: Option<CachedSource>,
}

enum Wake {
    Rerun,
    Finish(DriverStatus),
    /// Nothing can wake the driver any more.
    Idle,
}

impl PipelineDriver {
    pub fn new(engine: Arc<Engine>, definition: Vec<Step>) -> Self {
        Self {
            engine,
            definition,
            seed: Value::Null,
            render: None,
            max_runs: DEFAULT_MAX_RUNS,
            keep_alive: false,
            lease: None,
        }
    }

    pub fn with_seed(mut self, seed: Value) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_render(mut self, render: Arc<Render>) -> Self {
        self.render = Some(render);
        self
    }

    /// Upper bound on runs before the driver gives up.
    pub fn with_max_runs(mut self, max_runs: u64) -> Self {
        self.max_runs = max_runs.max(1);
        self
    }

    /// Keep listening for control messages after a run completes instead of
    /// finishing.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Drive the pipeline until it completes, fails, or is canceled.
    ///
    /// Every event carries the generation of the run it belongs to. The last
    /// event is always [`DriverEvent::Finished`].
    pub async fn drive(
        mut self,
        mut control_rx: UnboundedReceiver<DriverControl>,
        event_tx: UnboundedSender<DriverEvent>,
    ) -> DriverStatus {
        // Subscribe before the first run so no settlement is missed.
        let mut source_events = self.engine.source().map(|source| source.subscribe());
        self.lease = self.engine.source().map(CachedSource::leased);
        let mut control_open = true;
        let mut generation = 0;

        loop {
            generation += 1;
            if generation > self.max_runs {
                warn!(max_runs = self.max_runs, "pipeline driver reached its run limit");
                let _ = event_tx.send(DriverEvent::Failed {
                    generation: generation - 1,
                    error: format!("run limit of {} reached", self.max_runs),
                });
                return finish(&event_tx, generation - 1, DriverStatus::Failed);
            }

            if event_tx.send(DriverEvent::RunStarted { generation, at: Utc::now() }).is_err() {
                debug!(generation, "driver event receiver dropped; stopping");
                return DriverStatus::Canceled;
            }

            let result = self.engine.execute_with_source(
                self.lease.as_ref(),
                &self.definition,
                self.seed.clone(),
                self.render.as_deref(),
            );
            let (awaiting, idle_status): (HashSet<String>, DriverStatus) = match result {
                Ok(Outcome::Done(completion)) => {
                    info!(generation, "pipeline rendered");
                    let _ = event_tx.send(DriverEvent::Rendered {
                        generation,
                        value: completion.into_value(),
                    });
                    if !self.keep_alive {
                        return finish(&event_tx, generation, DriverStatus::Completed);
                    }
                    (HashSet::new(), DriverStatus::Completed)
                }
                Ok(Outcome::Suspended(suspension)) => {
                    debug!(generation, awaiting = ?suspension.awaiting, "pipeline suspended");
                    let awaiting = suspension.awaiting.iter().cloned().collect();
                    let _ = event_tx.send(DriverEvent::Suspended {
                        generation,
                        awaiting: suspension.awaiting,
                        placeholder: suspension.placeholder,
                    });
                    (awaiting, DriverStatus::Failed)
                }
                Err(error) => {
                    warn!(generation, error = %error, "pipeline run failed");
                    let _ = event_tx.send(DriverEvent::Failed {
                        generation,
                        error: error.to_string(),
                    });
                    if !self.keep_alive {
                        return finish(&event_tx, generation, DriverStatus::Failed);
                    }
                    (HashSet::new(), DriverStatus::Failed)
                }
            };

            let wake = self
                .wait(&awaiting, generation, &mut control_rx, &mut control_open, &mut source_events, &event_tx)
                .await;
            match wake {
                Wake::Rerun => continue,
                Wake::Finish(status) => return finish(&event_tx, generation, status),
                Wake::Idle => {
                    if idle_status == DriverStatus::Failed {
                        warn!(generation, "pipeline has nothing left to wake it");
                    }
                    return finish(&event_tx, generation, idle_status);
                }
            }
        }
    }

    async fn wait(
        &mut self,
        awaiting: &HashSet<String>,
        generation: u64,
        control_rx: &mut UnboundedReceiver<DriverControl>,
        control_open: &mut bool,
        source_events: &mut Option<broadcast::Receiver<SourceEvent>>,
        event_tx: &UnboundedSender<DriverEvent>,
    ) -> Wake {
        loop {
            if !*control_open && (source_events.is_none() || awaiting.is_empty()) {
                return Wake::Idle;
            }

            tokio::select! {
                control = control_rx.recv(), if *control_open => match control {
                    Some(DriverControl::Replace(definition)) => {
                        info!(generation, steps = definition.len(), "definition replaced; superseding run");
                        self.definition = definition;
                        self.lease = self.engine.source().map(CachedSource::leased);
                        return Wake::Rerun;
                    }
                    Some(DriverControl::Rerun) => {
                        debug!(generation, "re-run requested");
                        return Wake::Rerun;
                    }
                    Some(DriverControl::Cancel) => {
                        info!(generation, "pipeline driver canceled");
                        return Wake::Finish(DriverStatus::Canceled);
                    }
                    None => *control_open = false,
                },
                event = next_source_event(source_events) => match event {
                    Ok(event) if awaiting.contains(event.key()) => {
                        debug!(generation, key = %event.key(), "awaited entry settled; re-running");
                        return Wake::Rerun;
                    }
                    Ok(event) => {
                        debug!(generation, key = %event.key(), "discarding stale settlement");
                        let _ = event_tx.send(DriverEvent::StaleDiscarded {
                            generation,
                            key: event.key().to_string(),
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(generation, skipped, "source events lagged; re-running");
                        return Wake::Rerun;
                    }
                    Err(RecvError::Closed) => *source_events = None,
                },
            }
        }
    }
}

async fn next_source_event(events: &mut Option<broadcast::Receiver<SourceEvent>>) -> Result<SourceEvent, RecvError> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => future::pending().await,
    }
}

fn finish(event_tx: &UnboundedSender<DriverEvent>, generation: u64, status: DriverStatus) -> DriverStatus {
    let _ = event_tx.send(DriverEvent::Finished {
        generation,
        status,
        finished_at: Utc::now(),
    });
    status
}

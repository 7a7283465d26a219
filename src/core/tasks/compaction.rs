// src/core/tasks/compaction.rs

//! The state-store auto-compaction background task.
//!
//! Per-item checkpoint durability makes the store log grow one record
//! per processed item. This task periodically checks whether the log has
//! outgrown the live key set and rewrites it as a snapshot when it has,
//! with a final pass on shutdown.

use crate::core::state::EngineState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// The background task struct for store log compaction.
pub struct StoreCompactionTask {
    state: Arc<EngineState>,
}

impl StoreCompactionTask {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    /// The main run loop. Checks the growth condition on a fixed
    /// interval and performs a last compaction on shutdown if the log
    /// is worth rewriting.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let (growth_factor, check_interval) = {
            let config = self.state.config.lock().await;
            (
                config.store.compaction_growth_factor,
                config.store.compaction_check_interval,
            )
        };

        info!(
            "Store compaction task started: growth factor {}, check interval {:?}.",
            growth_factor, check_interval
        );
        let mut interval = tokio::time::interval(check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.state.store.should_compact(growth_factor) {
                        info!(
                            "Store log grew to {} appended records; compacting.",
                            self.state.store.appended_records()
                        );
                        if let Err(e) = self.state.store.compact().await {
                            error!("Store compaction failed: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Store compaction task received shutdown signal.");
                    if self.state.store.should_compact(growth_factor) {
                        info!("Performing final store compaction on shutdown...");
                        if let Err(e) = self.state.store.compact().await {
                            error!("Final store compaction on shutdown failed: {}", e);
                        }
                    }
                    info!("Store compaction task finished.");
                    return;
                }
            }
        }
    }
}

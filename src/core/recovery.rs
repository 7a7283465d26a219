// src/core/recovery.rs

//! Rehydrates the FSM tree from the durable store after a process
//! restart.
//!
//! Every provider record is read back, its executor rebuilt from the
//! registry, and its newest checkpoint injected as the resume point.
//! Providers that were active re-request permits; paused and backed-off
//! providers keep their posture; terminal and idle providers are left
//! untouched. Recovery is idempotent: re-running against an unchanged
//! store yields the same tree.

use crate::core::UeeError;
use crate::core::executor::ResumePoint;
use crate::core::fsm::provider::{CheckpointRecord, ProviderFsm, ProviderRecord, ProviderTunables};
use crate::core::fsm::MacroFsm;
use crate::core::state::EngineState;
use crate::core::store::Namespace;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// The outcome counts of one recovery pass.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Providers reactivated (permits re-requested or timers re-armed).
    pub recovered: usize,
    /// Providers rehydrated but intentionally left in place
    /// (IDLE/PAUSED/TERMINATED, or already registered).
    pub skipped: usize,
    /// Records that could not be rehydrated (undecodable, or no
    /// executor registered for their type).
    pub failed: usize,
}

/// Rebuilds provider FSMs from the store on process start.
pub struct RecoveryManager {
    engine: Arc<EngineState>,
}

impl RecoveryManager {
    pub fn new(engine: Arc<EngineState>) -> Self {
        Self { engine }
    }

    /// Runs one recovery pass, registering every rehydrated provider
    /// with the orchestrator.
    pub async fn run(&self, orchestrator: &Arc<MacroFsm>) -> Result<RecoveryReport, UeeError> {
        let mut report = RecoveryReport::default();
        let records = self
            .engine
            .store
            .list_by_prefix(Namespace::FsmProvider, "");
        info!("Recovery found {} provider record(s).", records.len());

        for (key, envelope) in records {
            let record: ProviderRecord = match envelope.decode() {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping undecodable provider record '{}': {}", key, e);
                    report.failed += 1;
                    continue;
                }
            };
            let prior_state = record.state;
            let provider_id = record.id.clone();

            let factory = match self.engine.executors.get(&record.provider_type) {
                Ok(f) => f,
                Err(e) => {
                    warn!(
                        "Cannot recover provider '{}': {}. Leaving its record in place.",
                        provider_id, e
                    );
                    report.failed += 1;
                    continue;
                }
            };
            let executor = match factory.build(&serde_json::Value::Null) {
                Ok(e) => e,
                Err(e) => {
                    warn!(
                        "Executor construction failed for recovered provider '{}': {}",
                        provider_id, e
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let resume = self.latest_resume_point(&provider_id);
            let tunables = ProviderTunables::from_config(&*self.engine.config.lock().await);
            let fsm = ProviderFsm::from_record(
                record,
                resume,
                executor,
                tunables,
                Arc::clone(&self.engine),
                orchestrator.event_sender(),
            );

            match orchestrator.register_provider(Arc::clone(&fsm)).await {
                Ok(()) => {}
                Err(UeeError::ProviderExists(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Could not register recovered provider '{}': {}", provider_id, e);
                    report.failed += 1;
                    continue;
                }
            }

            match fsm.recover().await {
                Ok(true) => {
                    info!(
                        "Provider '{}' recovered from {} and reactivated.",
                        provider_id, prior_state
                    );
                    report.recovered += 1;
                }
                Ok(false) => {
                    info!(
                        "Provider '{}' rehydrated in {} and left in place.",
                        provider_id, prior_state
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!("Provider '{}' failed to reactivate: {}", provider_id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Recovery complete: {} recovered, {} skipped, {} failed.",
            report.recovered, report.skipped, report.failed
        );
        Ok(report)
    }

    /// The provider's newest checkpoint (highest sequence), decoded into
    /// a resume point for its executor.
    fn latest_resume_point(&self, provider_id: &str) -> Option<ResumePoint> {
        let (_, envelope) = self.engine.store.latest_checkpoint(provider_id)?;
        match envelope.decode::<CheckpointRecord>() {
            Ok(cp) => Some(ResumePoint {
                urn: cp.urn,
                sequence: cp.sequence,
            }),
            Err(e) => {
                warn!(
                    "Newest checkpoint of provider '{}' is undecodable: {}",
                    provider_id, e
                );
                None
            }
        }
    }
}

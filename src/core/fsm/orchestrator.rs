// src/core/fsm/orchestrator.rs

//! The process-wide orchestrator (macro) FSM.
//!
//! Exactly one exists per engine. It owns the provider FSMs, fans their
//! lifecycle events into a single bounded queue drained by one consumer
//! task, routes quota updates from the adaptive controller to the
//! affected providers, and tracks the engine-level lifecycle
//! BOOTSTRAPPING → ORCHESTRATING ↔ STABILIZING → DRAINING.
//!
//! Providers hold only a sender clone back to this queue, so the
//! ownership graph stays acyclic.

use crate::core::UeeError;
use crate::core::events::EngineEvent;
use crate::core::fsm::provider::{ProviderFsm, ProviderRecord};
use crate::core::fsm::transitions::{MacroState, ProviderState, check_macro_transition};
use crate::core::state::EngineState;
use crate::core::store::{Envelope, Namespace};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Schema version for the orchestrator record.
pub const MACRO_SCHEMA: u32 = 1;
/// The singleton key of the orchestrator record in `fsm_macro`.
const MACRO_RECORD_KEY: &str = "orchestrator";
/// Bounded capacity of the orchestrator event queue; producers block
/// when it is full.
pub const MACRO_EVENT_CAPACITY: usize = 100;
/// Period of the stability scan.
const MACRO_TICK: Duration = Duration::from_secs(1);

/// Events fanned into the orchestrator queue by providers and the
/// control plane. Ordering is per-producer FIFO; cross-producer
/// ordering is not guaranteed.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    ProviderStateChanged {
        provider_id: String,
        state: ProviderState,
    },
    ProviderFailed {
        provider_id: String,
        error: String,
    },
    StoreFatal {
        detail: String,
    },
}

/// The durable form of the orchestrator, stored in the `fsm_macro`
/// namespace.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MacroRecord {
    pub state: MacroState,
    pub providers: Vec<String>,
    pub last_event_at: DateTime<Utc>,
}

/// The control-plane view of the whole ETL tree.
#[derive(Serialize, Debug, Clone)]
pub struct EtlTree {
    pub macro_state: MacroState,
    pub providers: Vec<ProviderRecord>,
}

struct MacroInner {
    state: MacroState,
    last_event_at: DateTime<Utc>,
    recovery_done: bool,
    /// WAITING_QUOTA provider count observed at the previous tick;
    /// drives the sustained-revocation hysteresis.
    waiting_prev: usize,
}

/// The orchestrator FSM. Construct once per engine via [`MacroFsm::new`].
pub struct MacroFsm {
    engine: Arc<EngineState>,
    providers: DashMap<String, Arc<ProviderFsm>>,
    inner: parking_lot::Mutex<MacroInner>,
    event_tx: mpsc::Sender<OrchestratorEvent>,
    event_rx: parking_lot::Mutex<Option<mpsc::Receiver<OrchestratorEvent>>>,
}

impl MacroFsm {
    pub fn new(engine: Arc<EngineState>) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(MACRO_EVENT_CAPACITY);
        Arc::new(Self {
            engine,
            providers: DashMap::new(),
            inner: parking_lot::Mutex::new(MacroInner {
                state: MacroState::Bootstrapping,
                last_event_at: Utc::now(),
                recovery_done: false,
                waiting_prev: 0,
            }),
            event_tx,
            event_rx: parking_lot::Mutex::new(Some(event_rx)),
        })
    }

    pub fn state(&self) -> MacroState {
        self.inner.lock().state
    }

    /// A sender clone for providers to bubble events through. This is
    /// the only back-reference providers hold.
    pub fn event_sender(&self) -> mpsc::Sender<OrchestratorEvent> {
        self.event_tx.clone()
    }

    /// Enqueues an event for the internal consumer. Blocks when the
    /// bounded buffer is full; that back-pressure is deliberate.
    pub async fn enqueue_event(&self, event: OrchestratorEvent) -> Result<(), UeeError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| UeeError::EventQueueClosed)
    }

    /// Adds a provider to the tree. Once recovery has completed and at
    /// least one provider is registered, the orchestrator leaves
    /// BOOTSTRAPPING.
    pub async fn register_provider(&self, provider: Arc<ProviderFsm>) -> Result<(), UeeError> {
        if self.inner.lock().state == MacroState::Draining {
            return Err(UeeError::Internal(
                "engine is draining; no new providers accepted".to_string(),
            ));
        }
        let id = provider.id().to_string();
        if self.providers.contains_key(&id) {
            return Err(UeeError::ProviderExists(id));
        }
        self.providers.insert(id.clone(), provider);
        info!("Provider '{}' registered with the orchestrator.", id);
        self.persist_provider_list().await?;
        self.maybe_leave_bootstrap().await;
        Ok(())
    }

    /// Removes a terminated provider from the tree.
    pub async fn unregister_provider(&self, provider_id: &str) -> Result<(), UeeError> {
        let Some(entry) = self.providers.get(provider_id) else {
            return Err(UeeError::ProviderNotFound(provider_id.to_string()));
        };
        if !entry.value().state().is_terminal() {
            return Err(UeeError::Internal(format!(
                "provider '{provider_id}' must be terminated before unregistering"
            )));
        }
        drop(entry);
        self.providers.remove(provider_id);
        info!("Provider '{}' unregistered.", provider_id);
        self.persist_provider_list().await?;
        Ok(())
    }

    pub fn get_provider(&self, provider_id: &str) -> Result<Arc<ProviderFsm>, UeeError> {
        self.providers
            .get(provider_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| UeeError::ProviderNotFound(provider_id.to_string()))
    }

    /// Moves the orchestrator to DRAINING and asks every provider to
    /// stop. The event loop keeps running until all of them are
    /// terminal, then exits.
    pub async fn shutdown(&self) {
        self.escalate_draining().await;
    }

    /// Marks recovery as finished. Until then the orchestrator stays in
    /// BOOTSTRAPPING regardless of registrations.
    pub async fn mark_recovery_complete(&self) {
        self.inner.lock().recovery_done = true;
        self.maybe_leave_bootstrap().await;
    }

    /// The control-plane snapshot: orchestrator state plus one row per
    /// provider, in id order.
    pub fn etl_tree(&self) -> EtlTree {
        let mut providers: Vec<ProviderRecord> = self
            .providers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        EtlTree {
            macro_state: self.state(),
            providers,
        }
    }

    /// The single internal event consumer. Runs until shutdown, then
    /// drains: every provider is stopped and the loop exits once all of
    /// them are terminal.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut rx = self
            .event_rx
            .lock()
            .take()
            .expect("orchestrator event loop started twice");
        let mut bus_rx = self.engine.events.subscribe();
        let mut tick = tokio::time::interval(MACRO_TICK);
        info!("Orchestrator event loop started.");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Orchestrator received shutdown signal.");
                    self.drain(&mut rx).await;
                    return;
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => self.consume_event(&rx, event).await,
                        None => {
                            warn!("Orchestrator event queue closed; draining.");
                            self.drain(&mut rx).await;
                            return;
                        }
                    }
                }
                result = bus_rx.recv() => self.handle_bus_event(result).await,
                _ = tick.tick() => {
                    if self.evaluate_tick().await {
                        info!("All providers terminated; orchestrator drained.");
                        return;
                    }
                }
            }
        }
    }

    /// Handles one queue event and feeds the routing substrate's health
    /// into the kernel metrics: per-event latency, queue occupancy, and
    /// the message/error rates.
    async fn consume_event(&self, rx: &mpsc::Receiver<OrchestratorEvent>, event: OrchestratorEvent) {
        let started = Instant::now();
        let is_error = matches!(
            event,
            OrchestratorEvent::ProviderFailed { .. } | OrchestratorEvent::StoreFatal { .. }
        );
        self.handle_event(event).await;
        self.engine.metrics.observe_latency(started.elapsed());
        self.engine
            .metrics
            .observe_buffer(rx.len(), MACRO_EVENT_CAPACITY);
        self.engine.metrics.tick_message(is_error);
        self.engine.stats.increment_events_processed();
    }

    async fn handle_event(&self, event: OrchestratorEvent) {
        self.inner.lock().last_event_at = Utc::now();
        match event {
            OrchestratorEvent::ProviderStateChanged { provider_id, state } => {
                debug!("Provider '{}' is now {}.", provider_id, state);
            }
            OrchestratorEvent::ProviderFailed { provider_id, error } => {
                warn!("Provider '{}' failed: {}", provider_id, error);
            }
            OrchestratorEvent::StoreFatal { detail } => {
                error!(
                    "Fatal state-store error reported: {}. Draining the engine.",
                    detail
                );
                self.escalate_draining().await;
            }
        }
    }

    /// Routes adaptive-controller quota updates to the affected
    /// providers. Lifecycle broadcasts are for external listeners and
    /// are ignored here.
    async fn handle_bus_event(&self, result: Result<EngineEvent, broadcast::error::RecvError>) {
        match result {
            Ok(EngineEvent::QuotaUpdate { revocations }) => {
                for revocation in revocations {
                    let Some(provider) = self
                        .providers
                        .get(&revocation.provider_id)
                        .map(|entry| Arc::clone(entry.value()))
                    else {
                        continue;
                    };
                    if let Err(e) = provider.on_quota_update(revocation.revoked).await {
                        warn!(
                            "Provider '{}' rejected a quota update: {}",
                            revocation.provider_id, e
                        );
                    }
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Orchestrator lagged {} bus event(s).", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {}
        }
    }

    /// The periodic stability scan. Returns true when the orchestrator
    /// is draining and every provider has terminated.
    async fn evaluate_tick(&self) -> bool {
        let state = self.state();
        match state {
            MacroState::Draining => self
                .providers
                .iter()
                .all(|entry| entry.value().state().is_terminal()),
            MacroState::Orchestrating | MacroState::Stabilizing => {
                let waiting = self
                    .providers
                    .iter()
                    .filter(|entry| entry.value().state() == ProviderState::WaitingQuota)
                    .count();
                let waiting_prev = {
                    let mut inner = self.inner.lock();
                    std::mem::replace(&mut inner.waiting_prev, waiting)
                };
                if state == MacroState::Orchestrating && waiting > 0 && waiting_prev > 0 {
                    info!(
                        "{} provider(s) starved of quota for a full tick; stabilizing.",
                        waiting
                    );
                    let _ = self.persist_macro(MacroState::Stabilizing).await;
                } else if state == MacroState::Stabilizing && waiting == 0 {
                    info!("No provider is waiting on quota; back to orchestrating.");
                    let _ = self.persist_macro(MacroState::Orchestrating).await;
                }
                false
            }
            MacroState::Bootstrapping => false,
        }
    }

    /// Stops every provider and consumes remaining events until all of
    /// them reach a terminal state.
    async fn drain(&self, rx: &mut mpsc::Receiver<OrchestratorEvent>) {
        self.escalate_draining().await;
        loop {
            if self
                .providers
                .iter()
                .all(|entry| entry.value().state().is_terminal())
            {
                break;
            }
            tokio::select! {
                Some(event) = rx.recv() => self.handle_event(event).await,
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        info!(
            "Orchestrator drained; {} provider(s) terminated.",
            self.providers.len()
        );
    }

    /// Moves to DRAINING and asks every provider to stop. Provider stop
    /// calls run concurrently; the event loop keeps draining while they
    /// settle.
    async fn escalate_draining(&self) {
        if self.state() == MacroState::Draining {
            return;
        }
        let _ = self.persist_macro(MacroState::Draining).await;
        for entry in self.providers.iter() {
            let provider = Arc::clone(entry.value());
            tokio::spawn(async move {
                if let Err(e) = provider.stop().await {
                    debug!(
                        "Provider '{}' stop during drain: {}",
                        provider.id(),
                        e
                    );
                }
            });
        }
    }

    async fn maybe_leave_bootstrap(&self) {
        let ready = {
            let inner = self.inner.lock();
            inner.state == MacroState::Bootstrapping
                && inner.recovery_done
                && !self.providers.is_empty()
        };
        if ready {
            let _ = self.persist_macro(MacroState::Orchestrating).await;
        }
    }

    /// Validates, durably writes, then applies an orchestrator
    /// transition. A failed store write escalates straight to DRAINING
    /// in memory and surfaces the error.
    async fn persist_macro(&self, to: MacroState) -> Result<(), UeeError> {
        let from = self.state();
        if from == to {
            return Ok(());
        }
        check_macro_transition(from, to)?;
        let record = self.record(to);
        let envelope = Envelope::new(MACRO_SCHEMA, &record)?;
        match self
            .engine
            .store
            .put(Namespace::FsmMacro, MACRO_RECORD_KEY, envelope)
            .await
        {
            Ok(()) => {
                self.inner.lock().state = to;
                info!("Orchestrator transitioned from {} to {}.", from, to);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to persist orchestrator state ({} -> {}): {}. Draining.",
                    from, to, e
                );
                self.inner.lock().state = MacroState::Draining;
                Err(e)
            }
        }
    }

    /// Re-records the provider list under the current state.
    async fn persist_provider_list(&self) -> Result<(), UeeError> {
        let record = self.record(self.state());
        let envelope = Envelope::new(MACRO_SCHEMA, &record)?;
        if let Err(e) = self
            .engine
            .store
            .put(Namespace::FsmMacro, MACRO_RECORD_KEY, envelope)
            .await
        {
            error!(
                "Failed to persist orchestrator provider list: {}. Draining.",
                e
            );
            self.inner.lock().state = MacroState::Draining;
            return Err(e);
        }
        Ok(())
    }

    fn record(&self, state: MacroState) -> MacroRecord {
        let mut providers: Vec<String> = self
            .providers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        providers.sort();
        MacroRecord {
            state,
            providers,
            last_event_at: self.inner.lock().last_event_at,
        }
    }
}

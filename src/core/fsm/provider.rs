// src/core/fsm/provider.rs

//! The per-provider finite state machine.
//!
//! A provider FSM drives one corpus executor through
//! fetch/checkpoint/retry with pause/resume/recovery. Every state
//! transition is validated against the enumerated set and made durable
//! before it takes effect in memory; every processed item is recorded as
//! a URN-keyed checkpoint before the next item is dispatched.
//!
//! Lock discipline: public operations serialize on `op_lock` (an async
//! mutex held across store writes); the `inner` snapshot lock is only
//! ever held briefly and never across I/O. At most one executor task
//! exists per FSM; the sentinel is the FSM state combined with the
//! `executor_live` flag, both mutated under the same locks.

use crate::core::UeeError;
use crate::core::events::EngineEvent;
use crate::core::executor::{CheckpointSink, Executor, ExecutorContext, ResumePoint};
use crate::core::fsm::orchestrator::OrchestratorEvent;
use crate::core::fsm::transitions::{ProviderState, check_provider_transition};
use crate::core::permits::{PERMIT_GRANT_SCHEMA, PermitGrant};
use crate::core::state::EngineState;
use crate::core::store::{Envelope, Namespace, checkpoint_key};
use crate::core::urn::Urn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Schema version for provider FSM records.
pub const PROVIDER_SCHEMA: u32 = 1;
/// Schema version for checkpoint records.
pub const CHECKPOINT_SCHEMA: u32 = 1;

/// Minimum backoff after an upstream rate limit.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);
/// Ceiling on exponential retry backoff, bounding worst-case recovery.
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Fallback poll period for providers parked in WAITING_QUOTA, in case
/// an availability notification is missed.
const QUOTA_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// The durable form of a provider FSM, stored in the `fsm_provider`
/// namespace under the provider id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderRecord {
    pub id: String,
    pub provider_type: String,
    /// URN provider namespace this corpus's items belong to.
    pub source: String,
    pub state: ProviderState,
    pub processed_count: u64,
    pub error_count: u64,
    pub permits_held: u32,
    pub sequence: u64,
    pub last_checkpoint_urn: Option<Urn>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One durable checkpoint, stored in the `checkpoints` namespace under
/// the composite key `(provider_id, sequence)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub provider_id: String,
    pub urn: Urn,
    pub success: bool,
    pub message: String,
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Per-provider knobs. Reads go through getters under a reader/writer
/// lock; changes take effect at the next loop iteration.
#[derive(Debug, Clone)]
pub struct ProviderTunables {
    /// Items between optional external sync points.
    pub batch_size: u32,
    /// Transient-failure retry budget before the provider terminates.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff.
    pub retry_delay: Duration,
    /// Worker permits requested when entering ACQUIRING.
    pub permit_target: u32,
}

impl ProviderTunables {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            batch_size: config.default_batch_size,
            max_retries: config.default_max_retries,
            retry_delay: config.default_retry_delay(),
            permit_target: config.default_permit_target,
        }
    }
}

#[derive(Debug, Clone)]
struct ProviderInner {
    state: ProviderState,
    processed_count: u64,
    error_count: u64,
    permits_held: u32,
    sequence: u64,
    last_checkpoint_urn: Option<Urn>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
    executor_live: bool,
    backoff_attempt: u32,
    /// Cancels the live executor, backoff timer, or quota waiter.
    task_cancel: Option<CancellationToken>,
}

/// The per-provider FSM. Constructed through [`ProviderFsm::create`] for
/// new providers or [`ProviderFsm::from_record`] during recovery.
pub struct ProviderFsm {
    id: String,
    provider_type: String,
    source: String,
    engine: Arc<EngineState>,
    events_tx: mpsc::Sender<OrchestratorEvent>,
    executor: Arc<dyn Executor>,
    tunables: RwLock<ProviderTunables>,
    inner: Mutex<ProviderInner>,
    /// Serializes lifecycle operations; held across store writes so a
    /// transition is durable before the next operation observes it.
    op_lock: tokio::sync::Mutex<()>,
}

impl ProviderFsm {
    /// Creates a fresh provider in IDLE and durably records it.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        id: String,
        provider_type: String,
        source: String,
        executor: Arc<dyn Executor>,
        tunables: ProviderTunables,
        engine: Arc<EngineState>,
        events_tx: mpsc::Sender<OrchestratorEvent>,
    ) -> Result<Arc<Self>, UeeError> {
        let inner = ProviderInner {
            state: ProviderState::Idle,
            processed_count: 0,
            error_count: 0,
            permits_held: 0,
            sequence: 0,
            last_checkpoint_urn: None,
            last_error: None,
            updated_at: Utc::now(),
            executor_live: false,
            backoff_attempt: 0,
            task_cancel: None,
        };
        let fsm = Arc::new(Self::with_inner(
            id,
            provider_type,
            source,
            executor,
            tunables,
            engine,
            events_tx,
            inner,
        ));
        let record = fsm.snapshot();
        let envelope = Envelope::new(PROVIDER_SCHEMA, &record)?;

        // Compare-and-swap so racing creates cannot clobber a live
        // record: the id is only claimable when it is absent or its
        // previous owner terminated.
        let current = fsm.engine.store.get(Namespace::FsmProvider, &fsm.id);
        let applied = match &current {
            None => {
                fsm.engine
                    .store
                    .compare_and_swap(Namespace::FsmProvider, &fsm.id, None, envelope)
                    .await?
            }
            Some(existing) => {
                let prior: ProviderRecord = existing.decode()?;
                if !prior.state.is_terminal() {
                    return Err(UeeError::ProviderExists(fsm.id.clone()));
                }
                fsm.engine
                    .store
                    .compare_and_swap(Namespace::FsmProvider, &fsm.id, Some(existing), envelope)
                    .await?
            }
        };
        if !applied {
            return Err(UeeError::ProviderExists(fsm.id.clone()));
        }
        Ok(fsm)
    }

    /// Rehydrates a provider from its durable record without writing.
    /// `resume` is the newest checkpoint found in the store; it wins
    /// over the record when a crash landed between the two writes.
    pub fn from_record(
        record: ProviderRecord,
        resume: Option<ResumePoint>,
        executor: Arc<dyn Executor>,
        tunables: ProviderTunables,
        engine: Arc<EngineState>,
        events_tx: mpsc::Sender<OrchestratorEvent>,
    ) -> Arc<Self> {
        // The checkpoint log is the source of truth for the resume
        // position: a crash can leave the provider record one item
        // behind its newest checkpoint.
        let (sequence, last_urn) = match resume {
            Some(cp) if cp.sequence >= record.sequence => (cp.sequence, Some(cp.urn)),
            _ => (record.sequence, record.last_checkpoint_urn),
        };
        let inner = ProviderInner {
            state: record.state,
            processed_count: record.processed_count,
            error_count: record.error_count,
            permits_held: 0,
            sequence,
            last_checkpoint_urn: last_urn,
            last_error: record.last_error,
            updated_at: Utc::now(),
            executor_live: false,
            backoff_attempt: 0,
            task_cancel: None,
        };
        Arc::new(Self::with_inner(
            record.id,
            record.provider_type,
            record.source,
            executor,
            tunables,
            engine,
            events_tx,
            inner,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn with_inner(
        id: String,
        provider_type: String,
        source: String,
        executor: Arc<dyn Executor>,
        tunables: ProviderTunables,
        engine: Arc<EngineState>,
        events_tx: mpsc::Sender<OrchestratorEvent>,
        inner: ProviderInner,
    ) -> Self {
        Self {
            id,
            provider_type,
            source,
            engine,
            events_tx,
            executor,
            tunables: RwLock::new(tunables),
            inner: Mutex::new(inner),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    pub fn state(&self) -> ProviderState {
        self.inner.lock().state
    }

    /// A point-in-time copy of the durable view of this provider.
    pub fn snapshot(&self) -> ProviderRecord {
        let inner = self.inner.lock();
        ProviderRecord {
            id: self.id.clone(),
            provider_type: self.provider_type.clone(),
            source: self.source.clone(),
            state: inner.state,
            processed_count: inner.processed_count,
            error_count: inner.error_count,
            permits_held: inner.permits_held,
            sequence: inner.sequence,
            last_checkpoint_urn: inner.last_checkpoint_urn.clone(),
            last_error: inner.last_error.clone(),
            updated_at: inner.updated_at,
        }
    }

    // --- Tunables (read-through under the tunables lock) ---

    pub fn batch_size(&self) -> u32 {
        self.tunables.read().batch_size
    }

    pub fn set_batch_size(&self, batch_size: u32) {
        self.tunables.write().batch_size = batch_size;
    }

    pub fn max_retries(&self) -> u32 {
        self.tunables.read().max_retries
    }

    pub fn set_max_retries(&self, max_retries: u32) {
        self.tunables.write().max_retries = max_retries;
    }

    pub fn retry_delay(&self) -> Duration {
        self.tunables.read().retry_delay
    }

    pub fn set_retry_delay(&self, retry_delay: Duration) {
        self.tunables.write().retry_delay = retry_delay;
    }

    pub fn permit_target(&self) -> u32 {
        self.tunables.read().permit_target
    }

    pub fn set_permit_target(&self, permit_target: u32) {
        self.tunables.write().permit_target = permit_target;
    }

    // --- Lifecycle operations ---

    /// IDLE/PAUSED → ACQUIRING, then RUNNING (permits granted) or
    /// WAITING_QUOTA (pool empty). Starting an already-active provider
    /// fails with `InvalidTransition` and has no side effects.
    pub async fn start(self: &Arc<Self>) -> Result<(), UeeError> {
        let _op = self.op_lock.lock().await;
        self.begin_acquiring().await
    }

    /// PAUSED → ACQUIRING; the same flow as `start`.
    pub async fn resume(self: &Arc<Self>) -> Result<(), UeeError> {
        let _op = self.op_lock.lock().await;
        {
            let inner = self.inner.lock();
            if inner.state != ProviderState::Paused {
                return Err(UeeError::InvalidTransition {
                    from: inner.state.to_string(),
                    to: ProviderState::Acquiring.to_string(),
                });
            }
        }
        self.begin_acquiring().await
    }

    /// RUNNING → PAUSED. Held permits return to the pool; the executor
    /// is cancelled at the next item boundary.
    pub async fn pause(&self) -> Result<(), UeeError> {
        let _op = self.op_lock.lock().await;
        {
            let inner = self.inner.lock();
            check_provider_transition(inner.state, ProviderState::Paused)?;
        }
        self.cancel_tasks();
        self.release_all_permits();
        self.persist_transition(ProviderState::Paused, |i| i.permits_held = 0)
            .await?;
        let _ = self.engine.store.delete(Namespace::Permits, &self.id).await;
        info!("Provider '{}' paused.", self.id);
        Ok(())
    }

    /// Any non-terminal state → TERMINATED. The final state is durable
    /// before this returns.
    pub async fn stop(&self) -> Result<(), UeeError> {
        let _op = self.op_lock.lock().await;
        {
            let inner = self.inner.lock();
            check_provider_transition(inner.state, ProviderState::Terminated)?;
        }
        self.cancel_tasks();
        self.release_all_permits();
        self.persist_transition(ProviderState::Terminated, |i| i.permits_held = 0)
            .await?;
        let _ = self.engine.store.delete(Namespace::Permits, &self.id).await;
        info!("Provider '{}' stopped.", self.id);
        Ok(())
    }

    /// Applies a permit revocation. A provider reduced to zero holdings
    /// parks in WAITING_QUOTA; otherwise it keeps running with reduced
    /// concurrency.
    pub async fn on_quota_update(self: &Arc<Self>, revoked: u32) -> Result<(), UeeError> {
        let _op = self.op_lock.lock().await;
        let (state, held) = {
            let inner = self.inner.lock();
            (inner.state, inner.permits_held)
        };
        if state != ProviderState::Running || revoked == 0 {
            return Ok(());
        }
        let new_held = held.saturating_sub(revoked);
        if new_held == 0 {
            warn!(
                "Provider '{}' lost all {} permit(s) to revocation; entering waiting_quota.",
                self.id, held
            );
            self.cancel_tasks();
            self.persist_transition(ProviderState::WaitingQuota, |i| i.permits_held = 0)
                .await?;
            let _ = self.engine.store.delete(Namespace::Permits, &self.id).await;
            self.spawn_quota_waiter();
        } else {
            debug!(
                "Provider '{}' lost {} permit(s) to revocation; {} remaining.",
                self.id, revoked, new_held
            );
            self.persist_update(|i| i.permits_held = new_held).await?;
            self.persist_grant(new_held).await?;
        }
        Ok(())
    }

    /// Classifies and applies a batch-level executor error.
    pub async fn handle_executor_error(self: &Arc<Self>, err: UeeError) -> Result<(), UeeError> {
        let _op = self.op_lock.lock().await;
        self.handle_error_inner(err).await;
        Ok(())
    }

    /// Post-restart reactivation, applied by the recovery manager.
    /// Providers that were RUNNING, ACQUIRING, or WAITING_QUOTA rewind
    /// to ACQUIRING and re-request permits; WAITING_BACKOFF re-arms its
    /// timer; everything else stays put. Returns whether the provider
    /// was reactivated.
    pub(crate) async fn recover(self: &Arc<Self>) -> Result<bool, UeeError> {
        let _op = self.op_lock.lock().await;
        let state = self.inner.lock().state;
        match state {
            ProviderState::Running | ProviderState::Acquiring | ProviderState::WaitingQuota => {
                // Rehydration normalization, not a runtime transition:
                // the executor from the previous process is gone, so the
                // in-memory FSM restarts the acquisition flow.
                self.inner.lock().state = ProviderState::Acquiring;
                self.acquire_or_wait().await?;
                Ok(true)
            }
            ProviderState::WaitingBackoff => {
                let delay = self.tunables.read().retry_delay;
                self.spawn_backoff_timer(delay);
                Ok(true)
            }
            ProviderState::Paused | ProviderState::Idle | ProviderState::Terminated => Ok(false),
        }
    }

    // --- Internal flow ---

    /// current → ACQUIRING → RUNNING/WAITING_QUOTA. Caller holds the op
    /// lock.
    async fn begin_acquiring(self: &Arc<Self>) -> Result<(), UeeError> {
        self.persist_transition(ProviderState::Acquiring, |i| i.permits_held = 0)
            .await?;
        self.acquire_or_wait().await
    }

    async fn acquire_or_wait(self: &Arc<Self>) -> Result<(), UeeError> {
        if self.try_grant_and_run().await? {
            return Ok(());
        }
        self.persist_transition(ProviderState::WaitingQuota, |i| i.permits_held = 0)
            .await?;
        info!(
            "Provider '{}' found the permit pool exhausted; waiting for quota.",
            self.id
        );
        self.spawn_quota_waiter();
        Ok(())
    }

    /// Requests permits and, if any were granted, transitions to RUNNING
    /// and dispatches the executor. Returns whether the provider is now
    /// running.
    async fn try_grant_and_run(self: &Arc<Self>) -> Result<bool, UeeError> {
        let target = self.tunables.read().permit_target;
        let granted = self.engine.permits.request(&self.id, target);
        if granted == 0 {
            return Ok(false);
        }
        let token = self.fresh_token();
        if let Err(e) = self
            .persist_transition(ProviderState::Running, |i| {
                i.permits_held = granted;
                i.executor_live = true;
            })
            .await
        {
            self.engine.permits.release(&self.id, granted);
            return Err(e);
        }
        self.persist_grant(granted).await?;
        self.spawn_executor(token);
        self.engine.stats.increment_providers_started();
        info!(
            "Provider '{}' is running with {} permit(s).",
            self.id, granted
        );
        Ok(true)
    }

    fn spawn_executor(self: &Arc<Self>, token: CancellationToken) {
        let resume = {
            let inner = self.inner.lock();
            inner.last_checkpoint_urn.clone().map(|urn| ResumePoint {
                urn,
                sequence: inner.sequence,
            })
        };
        let ctx = ExecutorContext::new(
            self.id.clone(),
            self.provider_type.clone(),
            self.tunables.read().batch_size,
            resume,
            token,
            Arc::clone(self) as Arc<dyn CheckpointSink>,
        );
        let fsm = Arc::clone(self);
        tokio::spawn(async move {
            let result = fsm.executor.run(ctx).await;
            fsm.on_executor_exit(result).await;
        });
    }

    /// Runs when the executor task returns, holding the op lock. An
    /// `Ok` while still RUNNING means the batch completed naturally; an
    /// `Ok` in any other state means a pause/stop/quota transition
    /// already settled things.
    async fn on_executor_exit(self: Arc<Self>, result: Result<(), UeeError>) {
        let _op = self.op_lock.lock().await;
        self.inner.lock().executor_live = false;
        match result {
            Ok(()) => {
                if self.inner.lock().state == ProviderState::Running {
                    self.release_all_permits();
                    if self
                        .persist_transition(ProviderState::Terminated, |i| i.permits_held = 0)
                        .await
                        .is_ok()
                    {
                        let _ = self.engine.store.delete(Namespace::Permits, &self.id).await;
                        info!("Provider '{}' completed its batch and terminated.", self.id);
                    }
                }
            }
            Err(e) => self.handle_error_inner(e).await,
        }
    }

    /// Error classification and the resulting transition. Caller holds
    /// the op lock.
    async fn handle_error_inner(self: &Arc<Self>, err: UeeError) {
        if let UeeError::StoreUnavailable(detail) = &err {
            self.store_failure(detail.clone()).await;
            return;
        }

        self.release_all_permits();
        let _ = self.engine.store.delete(Namespace::Permits, &self.id).await;

        match err.classify() {
            crate::core::ErrorClass::Unrecoverable => {
                error!("Provider '{}' failed unrecoverably: {}", self.id, err);
                let message = err.to_string();
                let _ = self
                    .persist_transition(ProviderState::Terminated, |i| {
                        i.permits_held = 0;
                        i.error_count += 1;
                        i.last_error = Some(message.clone());
                    })
                    .await;
                self.notify_failed(message);
            }
            crate::core::ErrorClass::RateLimit => {
                let delay = RATE_LIMIT_BACKOFF.max(self.tunables.read().retry_delay);
                warn!(
                    "Provider '{}' was rate limited: {}. Backing off for {:?}.",
                    self.id, err, delay
                );
                let message = err.to_string();
                if self
                    .persist_transition(ProviderState::WaitingBackoff, |i| {
                        i.permits_held = 0;
                        i.error_count += 1;
                        i.last_error = Some(message);
                    })
                    .await
                    .is_ok()
                {
                    self.spawn_backoff_timer(delay);
                }
            }
            crate::core::ErrorClass::Transient => {
                let attempt = self.inner.lock().backoff_attempt;
                let tunables = self.tunables.read().clone();
                if attempt >= tunables.max_retries {
                    let message = format!(
                        "retry budget exhausted after {} attempt(s): {err}",
                        attempt
                    );
                    error!("Provider '{}' terminated: {}", self.id, message);
                    let _ = self
                        .persist_transition(ProviderState::Terminated, |i| {
                            i.permits_held = 0;
                            i.error_count += 1;
                            i.last_error = Some(message.clone());
                        })
                        .await;
                    self.notify_failed(message);
                    return;
                }
                let delay = (tunables.retry_delay * 2u32.saturating_pow(attempt)).min(MAX_BACKOFF);
                warn!(
                    "Provider '{}' hit a transient failure (attempt {}): {}. Backing off for {:?}.",
                    self.id,
                    attempt + 1,
                    err,
                    delay
                );
                let message = err.to_string();
                if self
                    .persist_transition(ProviderState::WaitingBackoff, |i| {
                        i.permits_held = 0;
                        i.error_count += 1;
                        i.backoff_attempt += 1;
                        i.last_error = Some(message);
                    })
                    .await
                    .is_ok()
                {
                    self.spawn_backoff_timer(delay);
                }
            }
        }
    }

    fn spawn_backoff_timer(self: &Arc<Self>, delay: Duration) {
        let token = self.fresh_token();
        let fsm = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => fsm.retry_after_backoff().await,
                _ = token.cancelled() => {}
            }
        });
    }

    async fn retry_after_backoff(self: &Arc<Self>) {
        let _op = self.op_lock.lock().await;
        if self.inner.lock().state != ProviderState::WaitingBackoff {
            return;
        }
        if let Err(e) = self.begin_acquiring().await {
            warn!(
                "Provider '{}' failed to reacquire after backoff: {}",
                self.id, e
            );
        }
    }

    /// Parks until the pool publishes availability, then retries the
    /// ACQUIRING flow. One waiter exists per WAITING_QUOTA episode; it
    /// exits as soon as the provider leaves WAITING_QUOTA for any
    /// reason.
    fn spawn_quota_waiter(self: &Arc<Self>) {
        let token = self.fresh_token();
        let mut availability = self.engine.permits.subscribe_availability();
        let fsm = Arc::clone(self);
        tokio::spawn(async move {
            let mut retry = tokio::time::interval(QUOTA_RETRY_INTERVAL);
            retry.tick().await; // the first tick is immediate
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    changed = availability.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *availability.borrow() == 0 {
                            continue;
                        }
                    }
                    _ = retry.tick() => {}
                }
                if fsm.attempt_reacquire().await {
                    return;
                }
            }
        });
    }

    /// One reacquisition attempt from WAITING_QUOTA. Returns true when
    /// the waiter should exit (the provider ran, moved on, or errored).
    async fn attempt_reacquire(self: &Arc<Self>) -> bool {
        let _op = self.op_lock.lock().await;
        if self.inner.lock().state != ProviderState::WaitingQuota {
            return true;
        }
        if self
            .persist_transition(ProviderState::Acquiring, |i| i.permits_held = 0)
            .await
            .is_err()
        {
            return true;
        }
        match self.try_grant_and_run().await {
            Ok(true) => true,
            Ok(false) => {
                // Back to the bench; keep the same waiter.
                self.persist_transition(ProviderState::WaitingQuota, |i| i.permits_held = 0)
                    .await
                    .is_err()
            }
            Err(_) => true,
        }
    }

    // --- Persistence helpers ---

    /// Validates, durably writes, then applies a state transition. The
    /// attempt fails without mutation if the move is not enumerated or
    /// the store write fails.
    async fn persist_transition<F>(&self, to: ProviderState, mutate: F) -> Result<(), UeeError>
    where
        F: FnOnce(&mut ProviderInner),
    {
        let mut staged = self.inner.lock().clone();
        check_provider_transition(staged.state, to)?;
        staged.state = to;
        mutate(&mut staged);
        staged.updated_at = Utc::now();

        let record = self.record_of(&staged);
        let envelope = Envelope::new(PROVIDER_SCHEMA, &record)?;
        self.durable_put(Namespace::FsmProvider, self.id.clone(), envelope)
            .await?;

        *self.inner.lock() = staged;
        self.notify_state(to);
        Ok(())
    }

    /// Durably writes counter/holding changes that do not move the FSM.
    async fn persist_update<F>(&self, mutate: F) -> Result<(), UeeError>
    where
        F: FnOnce(&mut ProviderInner),
    {
        let mut staged = self.inner.lock().clone();
        mutate(&mut staged);
        staged.updated_at = Utc::now();

        let record = self.record_of(&staged);
        let envelope = Envelope::new(PROVIDER_SCHEMA, &record)?;
        self.durable_put(Namespace::FsmProvider, self.id.clone(), envelope)
            .await?;

        *self.inner.lock() = staged;
        Ok(())
    }

    async fn persist_grant(&self, count: u32) -> Result<(), UeeError> {
        let grant = PermitGrant {
            provider_id: self.id.clone(),
            count,
            acquired_at: Utc::now(),
        };
        let envelope = Envelope::new(PERMIT_GRANT_SCHEMA, &grant)?;
        self.durable_put(Namespace::Permits, self.id.clone(), envelope)
            .await
    }

    /// A store `put` that escalates failure: the provider terminates
    /// with `last_error` set and the orchestrator is told to drain.
    async fn durable_put(
        &self,
        ns: Namespace,
        key: String,
        envelope: Envelope,
    ) -> Result<(), UeeError> {
        match self.engine.store.put(ns, &key, envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let detail = e.to_string();
                self.store_failure(detail.clone()).await;
                Err(UeeError::StoreUnavailable(detail))
            }
        }
    }

    /// Fatal store error: terminate in memory, best-effort durable
    /// marker, escalate to the orchestrator.
    async fn store_failure(&self, detail: String) {
        error!(
            "Provider '{}' hit a fatal store error: {}",
            self.id, detail
        );
        self.cancel_tasks();
        self.release_all_permits();
        {
            let mut inner = self.inner.lock();
            inner.state = ProviderState::Terminated;
            inner.permits_held = 0;
            inner.last_error = Some(detail.clone());
            inner.updated_at = Utc::now();
        }
        if let Ok(envelope) = Envelope::new(PROVIDER_SCHEMA, &self.snapshot()) {
            let _ = self
                .engine
                .store
                .put(Namespace::FsmProvider, &self.id, envelope)
                .await;
        }
        let _ = self.events_tx.try_send(OrchestratorEvent::StoreFatal {
            detail: detail.clone(),
        });
        self.engine.events.publish(EngineEvent::ProviderFailed {
            provider_id: self.id.clone(),
            error: detail,
        });
    }

    fn record_of(&self, inner: &ProviderInner) -> ProviderRecord {
        ProviderRecord {
            id: self.id.clone(),
            provider_type: self.provider_type.clone(),
            source: self.source.clone(),
            state: inner.state,
            processed_count: inner.processed_count,
            error_count: inner.error_count,
            permits_held: inner.permits_held,
            sequence: inner.sequence,
            last_checkpoint_urn: inner.last_checkpoint_urn.clone(),
            last_error: inner.last_error.clone(),
            updated_at: inner.updated_at,
        }
    }

    fn release_all_permits(&self) {
        let held = self.inner.lock().permits_held;
        if held > 0 {
            self.engine.permits.release(&self.id, held);
        }
    }

    /// Replaces the current task token, cancelling whatever ran under
    /// the old one (executor, backoff timer, or quota waiter).
    fn fresh_token(&self) -> CancellationToken {
        let token = self.engine.root_cancel.child_token();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.task_cancel.take() {
            old.cancel();
        }
        inner.task_cancel = Some(token.clone());
        token
    }

    fn cancel_tasks(&self) {
        let mut inner = self.inner.lock();
        if let Some(token) = inner.task_cancel.take() {
            token.cancel();
        }
    }

    /// Bookkeeping notification to the orchestrator plus the public
    /// bus. `try_send` on the orchestrator queue: these fire from
    /// operations the orchestrator itself may be awaiting, so blocking
    /// here could wedge its event loop; the tick-based stability scan
    /// self-corrects for any dropped notification.
    fn notify_state(&self, state: ProviderState) {
        let _ = self
            .events_tx
            .try_send(OrchestratorEvent::ProviderStateChanged {
                provider_id: self.id.clone(),
                state,
            });
        self.engine.events.publish(EngineEvent::ProviderStateChanged {
            provider_id: self.id.clone(),
            state,
        });
    }

    fn notify_failed(&self, error: String) {
        let _ = self.events_tx.try_send(OrchestratorEvent::ProviderFailed {
            provider_id: self.id.clone(),
            error: error.clone(),
        });
        self.engine.events.publish(EngineEvent::ProviderFailed {
            provider_id: self.id.clone(),
            error,
        });
    }
}

#[async_trait]
impl CheckpointSink for ProviderFsm {
    /// Records one processed item: the checkpoint is durable before the
    /// provider record advances, and both land before the executor may
    /// dispatch the next item.
    async fn checkpoint(&self, urn: Urn, success: bool, message: &str) -> Result<(), UeeError> {
        let _op = self.op_lock.lock().await;

        if urn.provider() != self.source {
            return Err(UeeError::UrnParse(format!(
                "checkpoint URN provider '{}' does not match provider source '{}'",
                urn.provider(),
                self.source
            )));
        }

        let sequence = self.inner.lock().sequence + 1;
        let record = CheckpointRecord {
            provider_id: self.id.clone(),
            urn: urn.clone(),
            success,
            message: message.to_string(),
            sequence,
            recorded_at: Utc::now(),
        };
        let envelope = Envelope::new(CHECKPOINT_SCHEMA, &record)?;
        self.durable_put(
            Namespace::Checkpoints,
            checkpoint_key(&self.id, sequence),
            envelope,
        )
        .await?;

        self.persist_update(|i| {
            i.sequence = sequence;
            i.last_checkpoint_urn = Some(urn);
            if success {
                i.processed_count += 1;
                i.backoff_attempt = 0;
            } else {
                i.error_count += 1;
            }
        })
        .await?;

        self.engine.stats.increment_checkpoints_written();
        Ok(())
    }
}

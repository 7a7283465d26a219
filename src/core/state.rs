// src/core/state.rs

//! Defines the central `EngineState` struct, holding all shared
//! engine-wide services.

use crate::config::Config;
use crate::core::UeeError;
use crate::core::events::EventBus;
use crate::core::executor::ExecutorRegistry;
use crate::core::metrics::KernelMetrics;
use crate::core::permits::PermitManager;
use crate::core::store::StateStore;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    events_processed: AtomicU64,
    checkpoints_written: AtomicU64,
    providers_started: AtomicU64,
    revocation_actions: AtomicU64,
}

impl EngineStats {
    pub fn increment_events_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn increment_checkpoints_written(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_checkpoints_written(&self) -> u64 {
        self.checkpoints_written.load(Ordering::Relaxed)
    }

    pub fn increment_providers_started(&self) {
        self.providers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_providers_started(&self) -> u64 {
        self.providers_started.load(Ordering::Relaxed)
    }

    pub fn increment_revocation_actions(&self) {
        self.revocation_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_revocation_actions(&self) -> u64 {
        self.revocation_actions.load(Ordering::Relaxed)
    }
}

/// The central struct holding all shared, engine-wide services. Wrapped
/// in an `Arc` and passed to every FSM and background task, providing a
/// single source of truth for configuration and dynamic state.
pub struct EngineState {
    /// The runtime configuration, behind a Mutex so collaborators can
    /// adjust tunables while the engine runs.
    pub config: Arc<Mutex<Config>>,
    /// The durable state store for FSM states, checkpoints, and permit
    /// grants.
    pub store: Arc<StateStore>,
    /// The global worker-permit pool.
    pub permits: Arc<PermitManager>,
    /// Latency/saturation/rate observations of the routing substrate.
    pub metrics: Arc<KernelMetrics>,
    /// The broadcast bus for quota and provider lifecycle events.
    pub events: Arc<EventBus>,
    /// Per-corpus executor factories.
    pub executors: Arc<ExecutorRegistry>,
    /// Engine-wide counters.
    pub stats: EngineStats,
    /// A handle to the logging filter, allowing for dynamic log level
    /// changes through the control plane.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    /// The process-root cancellation token. Every executor, backoff
    /// timer, and waiter task runs under a child of this token.
    pub root_cancel: CancellationToken,
}

impl EngineState {
    /// Initializes the engine's shared services from the given
    /// configuration. This is the main factory function for the engine's
    /// shared context.
    pub async fn initialize(
        config: Config,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<Arc<Self>, UeeError> {
        let store = StateStore::open(Path::new(&config.data_dir)).await?;
        let permits = PermitManager::new(config.permit_pool_size);
        let metrics = KernelMetrics::new(config.metrics.latency_ring_capacity);

        info!(
            "Engine state initialized: permit pool size {}, data dir '{}'.",
            config.permit_pool_size, config.data_dir
        );

        Ok(Arc::new(Self {
            config: Arc::new(Mutex::new(config)),
            store: Arc::new(store),
            permits: Arc::new(permits),
            metrics: Arc::new(metrics),
            events: Arc::new(EventBus::new()),
            executors: Arc::new(ExecutorRegistry::new()),
            stats: EngineStats::default(),
            log_reload_handle,
            root_cancel: CancellationToken::new(),
        }))
    }
}

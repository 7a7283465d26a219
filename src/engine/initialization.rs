// src/engine/initialization.rs

//! Builds the engine's shared context and rehydrates the FSM tree.

use crate::config::Config;
use crate::core::UeeError;
use crate::core::api::ControlPlane;
use crate::core::fsm::MacroFsm;
use crate::core::recovery::{RecoveryManager, RecoveryReport};
use crate::core::state::EngineState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Everything a running engine consists of. Created once by
/// [`initialize`], then handed to the spawner.
pub struct EngineContext {
    pub state: Arc<EngineState>,
    pub orchestrator: Arc<MacroFsm>,
    pub control_plane: Arc<ControlPlane>,
    /// Fan-out shutdown signal; every background task holds a
    /// subscription.
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<()>,
}

/// Builds the shared state, orchestrator, and control plane. Executor
/// factories should be registered on `state.executors` before calling
/// [`recover`], so recovered providers can rebuild their executors.
pub async fn initialize(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<EngineContext, UeeError> {
    let state = EngineState::initialize(config, log_reload_handle).await?;
    let orchestrator = MacroFsm::new(Arc::clone(&state));
    let control_plane = Arc::new(ControlPlane::new(
        Arc::clone(&state),
        Arc::clone(&orchestrator),
    ));
    let (shutdown_tx, _) = broadcast::channel(1);
    Ok(EngineContext {
        state,
        orchestrator,
        control_plane,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

/// Runs the recovery pass and releases the orchestrator from
/// BOOTSTRAPPING.
pub async fn recover(ctx: &EngineContext) -> Result<RecoveryReport, UeeError> {
    let report = RecoveryManager::new(Arc::clone(&ctx.state))
        .run(&ctx.orchestrator)
        .await?;
    ctx.orchestrator.mark_recovery_complete().await;
    Ok(report)
}

// src/engine/spawner.rs

//! Spawns all of the engine's long-running background tasks.

use super::initialization::EngineContext;
use crate::core::tasks::compaction::StoreCompactionTask;
use crate::core::tasks::controller::AdaptiveController;
use std::sync::Arc;

/// Spawns the orchestrator event loop, the adaptive controller, and the
/// store compaction task, each with its own shutdown subscription.
pub fn spawn_all(ctx: &mut EngineContext) {
    let orchestrator = Arc::clone(&ctx.orchestrator);
    let shutdown_rx_orchestrator = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        orchestrator.run(shutdown_rx_orchestrator).await;
    });

    let controller = AdaptiveController::new(Arc::clone(&ctx.state));
    let shutdown_rx_controller = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        controller.run(shutdown_rx_controller).await;
    });

    let compaction = StoreCompactionTask::new(Arc::clone(&ctx.state));
    let shutdown_rx_compaction = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        compaction.run(shutdown_rx_compaction).await;
    });
}

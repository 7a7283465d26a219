// src/engine/mod.rs

//! Engine bootstrap: initialization, task spawning, and graceful
//! shutdown.

pub mod initialization;
pub mod spawner;

pub use initialization::{EngineContext, initialize, recover};

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

/// Runs the engine until a shutdown signal arrives or a critical
/// background task dies. The reload handle backs dynamic log-level
/// changes through the control plane. Library embedders who need to
/// register executor factories first should drive [`initialize`],
/// [`recover`], and [`spawner::spawn_all`] themselves.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let mut ctx = initialize(config, log_reload_handle).await?;

    let report = recover(&ctx).await?;
    info!(
        "Recovery: {} provider(s) recovered, {} skipped, {} failed.",
        report.recovered, report.skipped, report.failed
    );

    spawner::spawn_all(&mut ctx);
    info!("Unified ETL Engine is up.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received.");
        }
        Some(result) = ctx.background_tasks.join_next() => {
            warn!("A critical background task exited early: {:?}", result);
        }
    }

    // Cancel every executor, then fan the shutdown out to the
    // background tasks and wait for them to drain.
    ctx.state.root_cancel.cancel();
    let _ = ctx.shutdown_tx.send(());
    while ctx.background_tasks.join_next().await.is_some() {}

    info!("Engine shut down cleanly.");
    Ok(())
}

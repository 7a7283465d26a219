// src/core/tasks/controller.rs

//! The adaptive quota controller.
//!
//! A single cooperative loop polls the kernel metrics on a fixed period
//! and, when the routing substrate shows sustained distress, instructs
//! the permit manager to revoke a proportional slice of outstanding
//! permits. The two-consecutive-breach rule keeps noisy samples from
//! causing oscillation; proportional revocation spreads load relief
//! across tenants without starving any single provider.

use crate::core::events::EngineEvent;
use crate::core::state::EngineState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The throttling decision loop.
pub struct AdaptiveController {
    state: Arc<EngineState>,
}

impl AdaptiveController {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    /// Runs the controller until shutdown. Honors the signal within one
    /// tick.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let (tick, latency_threshold_ms, buffer_threshold_pct, fraction, hysteresis) = {
            let config = self.state.config.lock().await;
            (
                config.controller_tick(),
                config.latency_threshold_ms as f64,
                config.buffer_threshold_pct as f64,
                config.revocation_fraction,
                config.hysteresis_ticks,
            )
        };

        info!(
            "Adaptive controller started: tick {:?}, p99 ceiling {} ms, saturation ceiling {}%, \
             revocation fraction {}, hysteresis {} tick(s).",
            tick, latency_threshold_ms, buffer_threshold_pct, fraction, hysteresis
        );

        let mut interval = tokio::time::interval(tick);
        let mut latency_breaches: u32 = 0;
        let mut buffer_breaches: u32 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = self.state.metrics.snapshot();
                    let latency_breach = snapshot.p99_latency_ms > latency_threshold_ms;
                    let buffer_breach = snapshot.buffer_saturation_pct > buffer_threshold_pct;

                    if latency_breach {
                        latency_breaches += 1;
                        debug!(
                            "P99 latency {:.2} ms over ceiling ({} consecutive tick(s)).",
                            snapshot.p99_latency_ms, latency_breaches
                        );
                    }
                    if buffer_breach {
                        buffer_breaches += 1;
                        debug!(
                            "Buffer saturation {:.1}% over ceiling ({} consecutive tick(s)).",
                            snapshot.buffer_saturation_pct, buffer_breaches
                        );
                    }
                    if !latency_breach && !buffer_breach {
                        latency_breaches = latency_breaches.saturating_sub(1);
                        buffer_breaches = buffer_breaches.saturating_sub(1);
                    }

                    let mut act = false;
                    if latency_breaches >= hysteresis {
                        warn!(
                            "Sustained p99 latency breach ({:.2} ms); throttling.",
                            snapshot.p99_latency_ms
                        );
                        latency_breaches = 0;
                        act = true;
                    }
                    if buffer_breaches >= hysteresis {
                        warn!(
                            "Sustained buffer saturation breach ({:.1}%); throttling.",
                            snapshot.buffer_saturation_pct
                        );
                        buffer_breaches = 0;
                        act = true;
                    }
                    if act {
                        self.throttle(fraction);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Adaptive controller shutting down.");
                    return;
                }
            }
        }
    }

    /// One throttling action: proportional revocation plus a
    /// `QuotaUpdate` event for every listener.
    fn throttle(&self, fraction: f64) {
        let revocations = self.state.permits.revoke(fraction);
        self.state.stats.increment_revocation_actions();
        if revocations.is_empty() {
            debug!("Throttle action found no permit holders; nothing to revoke.");
            return;
        }
        self.state
            .events
            .publish(EngineEvent::QuotaUpdate { revocations });
    }
}

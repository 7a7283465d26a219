// tests/integration/fixtures.rs

//! Shared harness for the end-to-end scenarios: an engine with a
//! scripted CVE executor plugged into the registry.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing_subscriber::{Registry, filter::EnvFilter, reload};
use v2e_uee::config::Config;
use v2e_uee::core::api::ControlPlane;
use v2e_uee::core::executor::{Executor, ExecutorContext, ExecutorFactory};
use v2e_uee::core::fsm::provider::ProviderFsm;
use v2e_uee::core::fsm::{MacroFsm, ProviderState};
use v2e_uee::core::state::EngineState;
use v2e_uee::core::tasks::controller::AdaptiveController;
use v2e_uee::core::{UeeError, Urn};

fn log_reload_handle() -> Arc<reload::Handle<EnvFilter, Registry>> {
    let (_filter, handle) = reload::Layer::new(EnvFilter::new("info"));
    Arc::new(handle)
}

/// A scripted CVE executor. Items are named `CVE-<sequence>` so the
/// resume point alone determines where a run picks up.
pub struct ScriptedExecutor {
    /// Total items in the batch; `None` runs until cancelled.
    pub items: Option<u64>,
    pub item_delay: Duration,
    /// Fail with this error when about to process the given sequence.
    pub fail_at: Option<(u64, UeeError)>,
    pub runs: Arc<AtomicU32>,
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(&self, ctx: ExecutorContext) -> Result<(), UeeError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut next = ctx.resume_point().map(|p| p.sequence).unwrap_or(0);
        loop {
            next += 1;
            if let Some(total) = self.items {
                if next > total {
                    return Ok(());
                }
            }
            if ctx.is_cancelled() {
                return Ok(());
            }
            if let Some((fail_seq, err)) = &self.fail_at {
                if next == *fail_seq {
                    return Err(err.clone());
                }
            }
            if !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }
            let urn = Urn::new("nvd", "cve", format!("CVE-{next:04}"))?;
            ctx.checkpoint(urn, true, "").await?;
        }
    }
}

/// Builds [`ScriptedExecutor`]s sharing one run counter, so tests can
/// assert how many executor tasks ever existed.
pub struct ScriptedFactory {
    pub items: Option<u64>,
    pub item_delay: Duration,
    pub fail_at: Option<(u64, UeeError)>,
    pub runs: Arc<AtomicU32>,
}

impl ScriptedFactory {
    pub fn batch(items: u64) -> Self {
        Self {
            items: Some(items),
            item_delay: Duration::ZERO,
            fail_at: None,
            runs: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn endless(item_delay: Duration) -> Self {
        Self {
            items: None,
            item_delay,
            fail_at: None,
            runs: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn run_count(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.runs)
    }
}

impl ExecutorFactory for ScriptedFactory {
    fn source(&self) -> &str {
        "nvd"
    }

    fn build(&self, _config: &serde_json::Value) -> Result<Arc<dyn Executor>, UeeError> {
        Ok(Arc::new(ScriptedExecutor {
            items: self.items,
            item_delay: self.item_delay,
            fail_at: self.fail_at.clone(),
            runs: Arc::clone(&self.runs),
        }))
    }
}

/// One booted engine: shared state, orchestrator, and control plane.
/// Background loops are spawned on demand.
pub struct Harness {
    pub engine: Arc<EngineState>,
    pub orchestrator: Arc<MacroFsm>,
    pub plane: ControlPlane,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl Harness {
    pub async fn boot(dir: &Path, tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.data_dir = dir.to_str().unwrap().to_string();
        config.default_retry_delay_ms = 20;
        tweak(&mut config);
        let engine = EngineState::initialize(config, log_reload_handle()).await.unwrap();
        let orchestrator = MacroFsm::new(Arc::clone(&engine));
        let plane = ControlPlane::new(Arc::clone(&engine), Arc::clone(&orchestrator));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            engine,
            orchestrator,
            plane,
            shutdown_tx,
        }
    }

    /// Spawns the orchestrator event loop and the adaptive controller,
    /// as the engine bootstrap does.
    pub fn spawn_loops(&self) {
        tokio::spawn(Arc::clone(&self.orchestrator).run(self.shutdown_tx.subscribe()));
        tokio::spawn(
            AdaptiveController::new(Arc::clone(&self.engine)).run(self.shutdown_tx.subscribe()),
        );
    }

    pub fn provider(&self, id: &str) -> Arc<ProviderFsm> {
        self.orchestrator.get_provider(id).unwrap()
    }
}

pub async fn wait_for_provider_state(harness: &Harness, id: &str, want: ProviderState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if harness.provider(id).state() == want {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "provider '{id}' did not reach {want}, still {}",
            harness.provider(id).state()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_sequence(harness: &Harness, id: &str, want: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.provider(id).snapshot().sequence < want {
        assert!(
            Instant::now() < deadline,
            "provider '{id}' never reached sequence {want}, at {}",
            harness.provider(id).snapshot().sequence
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

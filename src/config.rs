// src/config.rs

//! Manages engine configuration: loading, defaulting, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// The fully resolved engine configuration.
///
/// Option names mirror what collaborator CLIs pass through: the engine
/// itself has no flag surface beyond `--config`/`--data-dir`/`--version`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Initial tracing filter, overridable via `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the durable state store.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Initial size of the global worker-permit pool.
    #[serde(default = "default_permit_pool_size")]
    pub permit_pool_size: u32,

    /// P99 latency ceiling; sustained breach triggers permit revocation.
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,

    /// Buffer saturation ceiling in percent; sustained breach triggers
    /// permit revocation.
    #[serde(default = "default_buffer_threshold_pct")]
    pub buffer_threshold_pct: u8,

    /// Period of the adaptive controller loop.
    #[serde(default = "default_controller_tick_ms")]
    pub controller_tick_ms: u64,

    /// Fraction of each holder's permits revoked per throttling action.
    #[serde(default = "default_revocation_fraction")]
    pub revocation_fraction: f64,

    /// Consecutive breached ticks required before the controller acts.
    #[serde(default = "default_hysteresis_ticks")]
    pub hysteresis_ticks: u32,

    /// Items between optional external sync points in an executor loop.
    #[serde(default = "default_batch_size")]
    pub default_batch_size: u32,

    /// Transient-failure retry budget before a provider terminates.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Base delay for exponential retry backoff.
    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,

    /// Worker permits a provider asks for when entering ACQUIRING.
    #[serde(default = "default_permit_target")]
    pub default_permit_target: u32,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Configuration for the kernel metrics sampler.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// Capacity of the latency sample ring used for percentile queries.
    #[serde(default = "default_latency_ring_capacity")]
    pub latency_ring_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_ring_capacity: default_latency_ring_capacity(),
        }
    }
}

/// Configuration for the durable state store.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    /// The store log is compacted once it grows past
    /// `live_records * compaction_growth_factor`.
    #[serde(default = "default_compaction_growth_factor")]
    pub compaction_growth_factor: u64,

    /// How often the compaction task checks the growth condition.
    #[serde(with = "humantime_serde", default = "default_compaction_check_interval")]
    pub compaction_check_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compaction_growth_factor: default_compaction_growth_factor(),
            compaction_check_interval: default_compaction_check_interval(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "uee_data".to_string()
}
fn default_permit_pool_size() -> u32 {
    32
}
fn default_latency_threshold_ms() -> u64 {
    30
}
fn default_buffer_threshold_pct() -> u8 {
    80
}
fn default_controller_tick_ms() -> u64 {
    5000
}
fn default_revocation_fraction() -> f64 {
    0.20
}
fn default_hysteresis_ticks() -> u32 {
    2
}
fn default_batch_size() -> u32 {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    5000
}
fn default_permit_target() -> u32 {
    4
}
fn default_latency_ring_capacity() -> usize {
    1000
}
fn default_compaction_growth_factor() -> u64 {
    4
}
fn default_compaction_check_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for Config {
    fn default() -> Self {
        // serde fills every field from its default function.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.trim().is_empty() {
            return Err(anyhow!("data_dir cannot be empty"));
        }
        if self.permit_pool_size == 0 {
            return Err(anyhow!("permit_pool_size cannot be 0"));
        }
        if !(self.revocation_fraction > 0.0 && self.revocation_fraction <= 1.0) {
            return Err(anyhow!(
                "revocation_fraction must be in (0, 1], got {}",
                self.revocation_fraction
            ));
        }
        if self.hysteresis_ticks == 0 {
            return Err(anyhow!("hysteresis_ticks cannot be 0"));
        }
        if self.buffer_threshold_pct > 100 {
            return Err(anyhow!(
                "buffer_threshold_pct must be at most 100, got {}",
                self.buffer_threshold_pct
            ));
        }
        if self.controller_tick_ms == 0 {
            return Err(anyhow!("controller_tick_ms cannot be 0"));
        }
        if self.default_batch_size == 0 {
            return Err(anyhow!("default_batch_size cannot be 0"));
        }
        if self.default_permit_target == 0 {
            return Err(anyhow!("default_permit_target cannot be 0"));
        }
        if self.metrics.latency_ring_capacity == 0 {
            return Err(anyhow!("metrics.latency_ring_capacity cannot be 0"));
        }
        if self.store.compaction_growth_factor < 2 {
            return Err(anyhow!(
                "store.compaction_growth_factor must be at least 2, got {}",
                self.store.compaction_growth_factor
            ));
        }
        Ok(())
    }

    /// The adaptive controller period as a `Duration`.
    pub fn controller_tick(&self) -> Duration {
        Duration::from_millis(self.controller_tick_ms)
    }

    /// The base retry delay as a `Duration`.
    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }
}

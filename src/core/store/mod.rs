// src/core/store/mod.rs

//! The durable state store: a namespaced, crash-consistent record store.
//!
//! Four logical namespaces hold the engine's durable state: macro FSM
//! state, provider FSM state, checkpoints, and permit grants. Writes go
//! through a single append-only log (fsynced before `put` returns) while
//! an in-memory ordered index serves reads and prefix scans. Writers
//! serialize on the log; readers never block writers beyond the brief
//! index lock.

pub mod log;

use crate::core::UeeError;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use strum_macros::{Display, EnumString};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use self::log::{LogOp, LogRecord, LogWriter};

/// The file name of the store log inside the data directory.
const LOG_FILE: &str = "state.log";

/// Compaction is pointless below this many appended records.
const COMPACTION_FLOOR: u64 = 1024;

/// Separator between the provider id and the sequence number in
/// checkpoint keys.
const CHECKPOINT_KEY_SEP: char = '/';

/// The four logical partitions of the store.
#[derive(
    Serialize,
    Deserialize,
    Display,
    EnumString,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Namespace {
    FsmMacro,
    FsmProvider,
    Checkpoints,
    Permits,
}

/// The self-describing envelope every stored value is wrapped in.
///
/// `schema` versions the body; unknown top-level fields land in `extra`
/// and survive a round-trip, so records written by a newer engine read
/// back intact.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub schema: u32,
    pub body: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    /// Wraps a typed body under the given schema version.
    pub fn new<T: Serialize>(schema: u32, body: &T) -> Result<Self, UeeError> {
        Ok(Self {
            schema,
            body: serde_json::to_value(body)?,
            extra: serde_json::Map::new(),
        })
    }

    /// Decodes the body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, UeeError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Builds the composite checkpoint key `(provider_id, sequence)`.
/// The sequence is zero-padded so lexicographic order equals numeric
/// order and the newest-per-provider query is a reverse prefix scan.
pub fn checkpoint_key(provider_id: &str, sequence: u64) -> String {
    format!("{provider_id}{CHECKPOINT_KEY_SEP}{sequence:020}")
}

/// The prefix covering every checkpoint of one provider.
pub fn checkpoint_prefix(provider_id: &str) -> String {
    format!("{provider_id}{CHECKPOINT_KEY_SEP}")
}

/// A namespaced, crash-consistent record store over an append-only log.
pub struct StateStore {
    index: RwLock<BTreeMap<(Namespace, String), Envelope>>,
    writer: tokio::sync::Mutex<LogWriter>,
    log_path: PathBuf,
    /// Records appended since open/compaction; drives the compaction
    /// trigger.
    appended: AtomicU64,
    compacting: AtomicBool,
}

impl StateStore {
    /// Opens (or creates) the store under `data_dir`, replaying the log
    /// into the in-memory index.
    pub async fn open(data_dir: &Path) -> Result<Self, UeeError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let log_path = data_dir.join(LOG_FILE);

        let records = log::replay(&log_path).await?;
        let replayed = records.len();
        let mut index = BTreeMap::new();
        for record in records {
            match record.op {
                LogOp::Put => {
                    if let Some(value) = record.value {
                        index.insert((record.ns, record.key), value);
                    }
                }
                LogOp::Del => {
                    index.remove(&(record.ns, record.key));
                }
            }
        }

        info!(
            "State store opened at {}: {} log records replayed, {} live keys.",
            log_path.display(),
            replayed,
            index.len()
        );

        let writer = LogWriter::open(&log_path).await?;
        Ok(Self {
            index: RwLock::new(index),
            writer: tokio::sync::Mutex::new(writer),
            log_path,
            appended: AtomicU64::new(replayed as u64),
            compacting: AtomicBool::new(false),
        })
    }

    /// Durably writes one record. Returns only after the log append has
    /// reached disk.
    pub async fn put(&self, ns: Namespace, key: &str, value: Envelope) -> Result<(), UeeError> {
        let record = LogRecord {
            ns,
            key: key.to_string(),
            op: LogOp::Put,
            value: Some(value.clone()),
        };
        let mut writer = self.writer.lock().await;
        writer.append(&record).await?;
        self.index.write().insert((ns, key.to_string()), value);
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Durably deletes one record. Deleting an absent key is a no-op.
    pub async fn delete(&self, ns: Namespace, key: &str) -> Result<(), UeeError> {
        let record = LogRecord {
            ns,
            key: key.to_string(),
            op: LogOp::Del,
            value: None,
        };
        let mut writer = self.writer.lock().await;
        writer.append(&record).await?;
        self.index.write().remove(&(ns, key.to_string()));
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Reads the committed value for a key, if any.
    pub fn get(&self, ns: Namespace, key: &str) -> Option<Envelope> {
        self.index.read().get(&(ns, key.to_string())).cloned()
    }

    /// Lists all committed records in a namespace whose key starts with
    /// `prefix`, in key order. An empty prefix lists the namespace.
    pub fn list_by_prefix(&self, ns: Namespace, prefix: &str) -> Vec<(String, Envelope)> {
        let index = self.index.read();
        index
            .range((ns, prefix.to_string())..)
            .take_while(|((n, k), _)| *n == ns && k.starts_with(prefix))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Atomic compare-and-swap used for FSM state transitions: the write
    /// happens only if the committed value still equals `expected`
    /// (`None` meaning the key must be absent). Returns whether the swap
    /// was applied.
    pub async fn compare_and_swap(
        &self,
        ns: Namespace,
        key: &str,
        expected: Option<&Envelope>,
        value: Envelope,
    ) -> Result<bool, UeeError> {
        let mut writer = self.writer.lock().await;
        {
            let index = self.index.read();
            let current = index.get(&(ns, key.to_string()));
            if current != expected {
                return Ok(false);
            }
        }
        let record = LogRecord {
            ns,
            key: key.to_string(),
            op: LogOp::Put,
            value: Some(value.clone()),
        };
        writer.append(&record).await?;
        self.index.write().insert((ns, key.to_string()), value);
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// The newest checkpoint of a provider: highest sequence via a
    /// reverse scan of the zero-padded composite key range.
    pub fn latest_checkpoint(&self, provider_id: &str) -> Option<(String, Envelope)> {
        let prefix = checkpoint_prefix(provider_id);
        let index = self.index.read();
        index
            .range((Namespace::Checkpoints, prefix.clone())..)
            .take_while(|((n, k), _)| *n == Namespace::Checkpoints && k.starts_with(&prefix))
            .last()
            .map(|((_, k), v)| (k.clone(), v.clone()))
    }

    /// True when the log has outgrown the live key set by `growth_factor`
    /// and is worth compacting.
    pub fn should_compact(&self, growth_factor: u64) -> bool {
        let appended = self.appended.load(Ordering::Relaxed);
        if appended < COMPACTION_FLOOR {
            return false;
        }
        let live = self.index.read().len() as u64;
        appended > live.saturating_mul(growth_factor)
    }

    /// Rewrites the log as a snapshot of the live index: write to a temp
    /// file, fsync, atomically rename over the log. Writers are blocked
    /// for the duration; at most one compaction runs at a time.
    pub async fn compact(&self) -> Result<(), UeeError> {
        if self
            .compacting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Store compaction already in progress. Skipping this trigger.");
            return Ok(());
        }
        let result = self.compact_inner().await;
        self.compacting.store(false, Ordering::SeqCst);
        result
    }

    async fn compact_inner(&self) -> Result<(), UeeError> {
        let mut writer = self.writer.lock().await;

        let snapshot: Vec<LogRecord> = {
            let index = self.index.read();
            index
                .iter()
                .map(|((ns, key), value)| LogRecord {
                    ns: *ns,
                    key: key.clone(),
                    op: LogOp::Put,
                    value: Some(value.clone()),
                })
                .collect()
        };
        let live = snapshot.len() as u64;

        let temp_path = self
            .log_path
            .with_extension(format!("tmp.{}", rand::random::<u32>()));
        let mut temp = tokio::fs::File::create(&temp_path).await?;
        for record in &snapshot {
            let frame = log::encode_record(record)?;
            temp.write_all(&frame).await?;
        }
        temp.flush().await?;
        temp.sync_all().await?;
        drop(temp);

        if let Err(e) = tokio::fs::rename(&temp_path, &self.log_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        writer.reopen().await?;
        self.appended.store(live, Ordering::Relaxed);

        info!("State store log compacted to {} live records.", live);
        Ok(())
    }

    /// Number of records appended since open or the last compaction.
    pub fn appended_records(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }
}

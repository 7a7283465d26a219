// src/core/executor.rs

//! The executor contract between the scheduler and per-corpus ingestion
//! logic.
//!
//! Provider behaviors differ per corpus, so the FSM base stays free of
//! per-corpus branching: it drives an injected `Executor` through a
//! context that exposes cancellation, checkpointing, and the recovery
//! resume point. New corpora plug in by registering a factory under a
//! type tag.

use crate::core::UeeError;
use crate::core::urn::Urn;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where a recovered executor should pick up: the last durably
/// checkpointed item and its sequence number.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub urn: Urn,
    pub sequence: u64,
}

/// Timeout classes for collaborator calls an executor makes. Timed-out
/// calls surface to error handling as transient unless the collaborator
/// signalled a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// Metadata lookups and cheap queries.
    Short,
    /// Ordinary fetch/parse/store calls.
    Default,
    /// Multi-record batch operations.
    Bulk,
    /// Whole-corpus import passes.
    Import,
}

impl OperationClass {
    pub fn timeout(&self) -> std::time::Duration {
        let secs = match self {
            OperationClass::Short => 10,
            OperationClass::Default => 30,
            OperationClass::Bulk => 60,
            OperationClass::Import => 300,
        };
        std::time::Duration::from_secs(secs)
    }
}

/// The checkpoint write-path handed to executors. Implemented by the
/// provider FSM; writes are durable before the call returns.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn checkpoint(&self, urn: Urn, success: bool, message: &str) -> Result<(), UeeError>;
}

/// Everything an executor run needs from the scheduler.
#[derive(Clone)]
pub struct ExecutorContext {
    provider_id: String,
    provider_type: String,
    batch_size: u32,
    resume: Option<ResumePoint>,
    cancel: CancellationToken,
    sink: Arc<dyn CheckpointSink>,
}

impl ExecutorContext {
    pub fn new(
        provider_id: String,
        provider_type: String,
        batch_size: u32,
        resume: Option<ResumePoint>,
        cancel: CancellationToken,
        sink: Arc<dyn CheckpointSink>,
    ) -> Self {
        Self {
            provider_id,
            provider_type,
            batch_size,
            resume,
            cancel,
            sink,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    /// Items between optional external sync points, sampled when the
    /// executor was dispatched.
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// The recovery-injected resume point, if this run continues an
    /// earlier one. Executors skip everything up to and including it.
    pub fn resume_point(&self) -> Option<&ResumePoint> {
        self.resume.as_ref()
    }

    /// True once the scheduler wants the run to end. Executors check
    /// this between items and return `Ok` promptly when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the scheduler wants the run to end; for executors
    /// that wait on external I/O and want to race it against shutdown.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Records one processed item. Durable before return; the next item
    /// must not be dispatched until this resolves. A `success = false`
    /// checkpoint records a per-item failure without ending the run.
    pub async fn checkpoint(
        &self,
        urn: Urn,
        success: bool,
        message: &str,
    ) -> Result<(), UeeError> {
        self.sink.checkpoint(urn, success, message).await
    }
}

/// A batch ingestion routine for one corpus.
///
/// The run loop contract: check `ctx.is_cancelled()` between items, call
/// `ctx.checkpoint` after each item, and return an error only for
/// batch-level fatal conditions. Returning `Ok` means the batch is
/// complete (or the run was cancelled cooperatively).
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, ctx: ExecutorContext) -> Result<(), UeeError>;
}

/// Builds executors for one provider type.
pub trait ExecutorFactory: Send + Sync {
    /// The URN provider namespace this corpus's items belong to,
    /// e.g. `nvd` for CVE content. Checkpoint URNs are validated
    /// against it.
    fn source(&self) -> &str;

    /// Builds an executor from the per-provider configuration blob.
    fn build(&self, config: &serde_json::Value) -> Result<Arc<dyn Executor>, UeeError>;
}

/// The registry collaborators plug their corpus executors into, keyed by
/// provider type tag (`cve`, `cwe`, `capec`, ...).
#[derive(Default)]
pub struct ExecutorRegistry {
    factories: DashMap<String, Arc<dyn ExecutorFactory>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a provider type, replacing any previous
    /// registration for the same tag.
    pub fn register(&self, provider_type: impl Into<String>, factory: Arc<dyn ExecutorFactory>) {
        self.factories.insert(provider_type.into(), factory);
    }

    pub fn get(&self, provider_type: &str) -> Result<Arc<dyn ExecutorFactory>, UeeError> {
        self.factories
            .get(provider_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| UeeError::UnknownProviderType(provider_type.to_string()))
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }
}

// src/core/api.rs

//! The logical RPC contract surface.
//!
//! Transport-agnostic request/response pairs: every response carries a
//! `retcode` (0 = success) plus either a payload or an error
//! description. Collaborators bind these to whatever transport they
//! use; `OnQuotaUpdate` delivery rides the engine event bus, which any
//! listener can subscribe to through [`crate::core::events::EventBus`].

use crate::core::UeeError;
use crate::core::fsm::provider::{CheckpointRecord, ProviderFsm, ProviderTunables};
use crate::core::fsm::{EtlTree, MacroFsm};
use crate::core::metrics::KernelMetricsSnapshot;
use crate::core::state::EngineState;
use crate::core::store::{Namespace, checkpoint_prefix};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

pub const RETCODE_OK: i32 = 0;
pub const RETCODE_INTERNAL: i32 = 1;
pub const RETCODE_INVALID_TRANSITION: i32 = 2;
pub const RETCODE_NOT_FOUND: i32 = 3;
pub const RETCODE_ALREADY_EXISTS: i32 = 4;
pub const RETCODE_UNKNOWN_TYPE: i32 = 5;
pub const RETCODE_STORE_UNAVAILABLE: i32 = 6;
pub const RETCODE_BAD_REQUEST: i32 = 7;

fn retcode_for(err: &UeeError) -> i32 {
    match err {
        UeeError::InvalidTransition { .. } => RETCODE_INVALID_TRANSITION,
        UeeError::ProviderNotFound(_) => RETCODE_NOT_FOUND,
        UeeError::ProviderExists(_) => RETCODE_ALREADY_EXISTS,
        UeeError::UnknownProviderType(_) => RETCODE_UNKNOWN_TYPE,
        UeeError::StoreUnavailable(_) => RETCODE_STORE_UNAVAILABLE,
        UeeError::UrnParse(_) | UeeError::InvalidConfig(_) => RETCODE_BAD_REQUEST,
        _ => RETCODE_INTERNAL,
    }
}

/// The uniform response wrapper.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcResponse<T> {
    pub retcode: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
}

impl<T> RpcResponse<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            retcode: RETCODE_OK,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn from_error(err: &UeeError) -> Self {
        Self {
            retcode: retcode_for(err),
            error: Some(err.to_string()),
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.retcode == RETCODE_OK
    }
}

impl<T> From<Result<T, UeeError>> for RpcResponse<T> {
    fn from(result: Result<T, UeeError>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(e) => Self::from_error(&e),
        }
    }
}

// --- Request/response payloads ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartProviderRequest {
    pub provider_type: String,
    /// Opaque per-provider configuration handed to the executor factory.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Explicit id; defaults to the provider type, giving one FSM per
    /// corpus.
    #[serde(default)]
    pub provider_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartProviderPayload {
    pub provider_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProviderIdRequest {
    pub provider_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetProviderCheckpointsRequest {
    pub provider_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckpointsPayload {
    pub checkpoints: Vec<CheckpointRecord>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestPermitsRequest {
    pub provider_id: String,
    pub count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestPermitsPayload {
    pub granted: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReleasePermitsRequest {
    pub provider_id: String,
    pub count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetLogLevelRequest {
    /// A tracing filter directive, e.g. `info` or `v2e_uee=debug`.
    pub filter: String,
}

/// An intentionally empty payload for operations with nothing to
/// return.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Empty {}

/// The operation surface collaborators call. One instance per engine.
pub struct ControlPlane {
    engine: Arc<EngineState>,
    orchestrator: Arc<MacroFsm>,
}

impl ControlPlane {
    pub fn new(engine: Arc<EngineState>, orchestrator: Arc<MacroFsm>) -> Self {
        Self {
            engine,
            orchestrator,
        }
    }

    // --- Control plane ---

    pub async fn start_provider(
        &self,
        request: StartProviderRequest,
    ) -> RpcResponse<StartProviderPayload> {
        self.start_provider_inner(request)
            .await
            .map(|provider_id| StartProviderPayload { provider_id })
            .into()
    }

    async fn start_provider_inner(
        &self,
        request: StartProviderRequest,
    ) -> Result<String, UeeError> {
        let provider_id = request
            .provider_id
            .unwrap_or_else(|| request.provider_type.clone());

        // An already-registered provider is driven, not re-created; a
        // live one answers with InvalidTransition and no side effects.
        if let Ok(existing) = self.orchestrator.get_provider(&provider_id) {
            existing.start().await?;
            return Ok(provider_id);
        }

        let factory = self.engine.executors.get(&request.provider_type)?;
        let executor = factory.build(&request.config)?;
        let tunables = ProviderTunables::from_config(&*self.engine.config.lock().await);
        let fsm = ProviderFsm::create(
            provider_id.clone(),
            request.provider_type.clone(),
            factory.source().to_string(),
            executor,
            tunables,
            Arc::clone(&self.engine),
            self.orchestrator.event_sender(),
        )
        .await?;
        self.orchestrator.register_provider(Arc::clone(&fsm)).await?;
        info!(
            "Provider '{}' of type '{}' created via control plane.",
            provider_id, request.provider_type
        );
        fsm.start().await?;
        Ok(provider_id)
    }

    pub async fn stop_provider(&self, request: ProviderIdRequest) -> RpcResponse<Empty> {
        let result = async {
            let provider = self.orchestrator.get_provider(&request.provider_id)?;
            provider.stop().await?;
            Ok(Empty {})
        }
        .await;
        result.into()
    }

    pub async fn pause_provider(&self, request: ProviderIdRequest) -> RpcResponse<Empty> {
        let result = async {
            let provider = self.orchestrator.get_provider(&request.provider_id)?;
            provider.pause().await?;
            Ok(Empty {})
        }
        .await;
        result.into()
    }

    pub async fn resume_provider(&self, request: ProviderIdRequest) -> RpcResponse<Empty> {
        let result = async {
            let provider = self.orchestrator.get_provider(&request.provider_id)?;
            provider.resume().await?;
            Ok(Empty {})
        }
        .await;
        result.into()
    }

    pub fn get_etl_tree(&self) -> RpcResponse<EtlTree> {
        RpcResponse::ok(self.orchestrator.etl_tree())
    }

    /// Checkpoints of one provider, newest first, paged by
    /// offset/limit.
    pub fn get_provider_checkpoints(
        &self,
        request: GetProviderCheckpointsRequest,
    ) -> RpcResponse<CheckpointsPayload> {
        let entries = self
            .engine
            .store
            .list_by_prefix(Namespace::Checkpoints, &checkpoint_prefix(&request.provider_id));
        let mut checkpoints: Vec<CheckpointRecord> = entries
            .into_iter()
            .filter_map(|(_, envelope)| envelope.decode().ok())
            .collect();
        checkpoints.reverse();
        let checkpoints: Vec<CheckpointRecord> = checkpoints
            .into_iter()
            .skip(request.offset)
            .take(request.limit.unwrap_or(usize::MAX))
            .collect();
        RpcResponse::ok(CheckpointsPayload { checkpoints })
    }

    // --- Resource plane ---

    pub fn request_permits(
        &self,
        request: RequestPermitsRequest,
    ) -> RpcResponse<RequestPermitsPayload> {
        let granted = self
            .engine
            .permits
            .request(&request.provider_id, request.count);
        RpcResponse::ok(RequestPermitsPayload { granted })
    }

    pub fn release_permits(&self, request: ReleasePermitsRequest) -> RpcResponse<Empty> {
        self.engine
            .permits
            .release(&request.provider_id, request.count);
        RpcResponse::ok(Empty {})
    }

    pub fn get_kernel_metrics(&self) -> RpcResponse<KernelMetricsSnapshot> {
        RpcResponse::ok(self.engine.metrics.snapshot())
    }

    /// Swaps the engine's tracing filter at runtime through the reload
    /// handle installed at startup.
    pub fn set_log_level(&self, request: SetLogLevelRequest) -> RpcResponse<Empty> {
        let result: Result<Empty, UeeError> = (|| {
            let filter = EnvFilter::try_new(&request.filter).map_err(|e| {
                UeeError::InvalidConfig(format!(
                    "invalid log filter '{}': {e}",
                    request.filter
                ))
            })?;
            self.engine
                .log_reload_handle
                .reload(filter)
                .map_err(|e| UeeError::Internal(format!("failed to reload log filter: {e}")))?;
            info!("Log filter set to '{}'.", request.filter);
            Ok(Empty {})
        })();
        result.into()
    }
}

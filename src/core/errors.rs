// src/core/errors.rs

//! Defines the primary error type for the entire engine.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the engine.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum UeeError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("URN parse error: {0}")]
    UrnParse(String),

    #[error("Invalid transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Unrecoverable failure: {0}")]
    Unrecoverable(String),

    #[error("No provider registered with id '{0}'")]
    ProviderNotFound(String),

    #[error("A provider with id '{0}' already exists")]
    ProviderExists(String),

    #[error("No executor registered for provider type '{0}'")]
    UnknownProviderType(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Event queue closed")]
    EventQueueClosed,

    #[error("Internal Engine Error: {0}")]
    Internal(String),
}

/// The coarse classification the provider FSM applies to batch-level
/// executor failures. Classification rules beyond the rate-limit heuristic
/// are under-specified upstream, so the taxonomy stays small and the text
/// heuristic lives in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Upstream pushback (HTTP 429 and friends). Extended backoff.
    RateLimit,
    /// Retryable I/O or timeout. Exponential backoff.
    Transient,
    /// The provider cannot make progress. Terminal.
    Unrecoverable,
}

impl UeeError {
    /// Classifies an executor error for retry handling.
    ///
    /// Rate limits are identified by error text containing `rate limit`,
    /// `429`, or `too many requests` (case-insensitive). Explicitly
    /// unrecoverable and store errors are terminal; everything else is
    /// assumed retryable.
    pub fn classify(&self) -> ErrorClass {
        match self {
            UeeError::RateLimited(_) => ErrorClass::RateLimit,
            UeeError::Unrecoverable(_) | UeeError::StoreUnavailable(_) => ErrorClass::Unrecoverable,
            other => {
                let text = other.to_string().to_ascii_lowercase();
                if text.contains("rate limit")
                    || text.contains("429")
                    || text.contains("too many requests")
                {
                    ErrorClass::RateLimit
                } else {
                    ErrorClass::Transient
                }
            }
        }
    }
}

impl PartialEq for UeeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (UeeError::Io(e1), UeeError::Io(e2)) => e1.to_string() == e2.to_string(),
            (UeeError::UrnParse(s1), UeeError::UrnParse(s2)) => s1 == s2,
            (
                UeeError::InvalidTransition { from: f1, to: t1 },
                UeeError::InvalidTransition { from: f2, to: t2 },
            ) => f1 == f2 && t1 == t2,
            (UeeError::StoreUnavailable(s1), UeeError::StoreUnavailable(s2)) => s1 == s2,
            (UeeError::RateLimited(s1), UeeError::RateLimited(s2)) => s1 == s2,
            (UeeError::Transient(s1), UeeError::Transient(s2)) => s1 == s2,
            (UeeError::Unrecoverable(s1), UeeError::Unrecoverable(s2)) => s1 == s2,
            (UeeError::ProviderNotFound(s1), UeeError::ProviderNotFound(s2)) => s1 == s2,
            (UeeError::ProviderExists(s1), UeeError::ProviderExists(s2)) => s1 == s2,
            (UeeError::UnknownProviderType(s1), UeeError::UnknownProviderType(s2)) => s1 == s2,
            (UeeError::InvalidConfig(s1), UeeError::InvalidConfig(s2)) => s1 == s2,
            (UeeError::Internal(s1), UeeError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for UeeError {
    fn from(e: std::io::Error) -> Self {
        UeeError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for UeeError {
    fn from(e: serde_json::Error) -> Self {
        UeeError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

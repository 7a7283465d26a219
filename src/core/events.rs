// src/core/events.rs

//! The engine event bus: server-initiated fan-out of quota and provider
//! lifecycle events to every listener (the orchestrator, and any
//! collaborator that subscribed through the RPC surface).

use crate::core::fsm::ProviderState;
use crate::core::permits::Revocation;
use tokio::sync::broadcast::{self, Sender as BroadcastSender};
use tracing::debug;

/// The capacity of the broadcast channel. Quota updates are rare; the
/// headroom is for bursts of provider state changes during recovery.
const EVENT_BUS_CAPACITY: usize = 1024;

/// An event published to all bus subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The adaptive controller revoked permits; one entry per affected
    /// provider.
    QuotaUpdate { revocations: Vec<Revocation> },
    /// A provider moved to a new lifecycle state.
    ProviderStateChanged {
        provider_id: String,
        state: ProviderState,
    },
    /// A provider terminated on an unrecoverable error.
    ProviderFailed { provider_id: String, error: String },
}

/// One-to-many distribution of engine events.
#[derive(Debug)]
pub struct EventBus {
    sender: BroadcastSender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event to all subscribers. It's okay if there are no
    /// active subscribers.
    pub fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            debug!("Published an engine event with no active subscribers.");
        }
    }

    /// Provides a new receiver subscribed to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

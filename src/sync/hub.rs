//! Notification sink
//!
//! Fire-and-forget events describing sync progress. Components receive an
//! `EventSink` at construction and never wait on observers.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::models::{AnyModel, MutationEvent, MutationSyncMetadata};

const DEFAULT_CAPACITY: usize = 256;

/// Why a subscription stopped delivering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMutationEvent {
    pub model_name: String,
    pub model: AnyModel,
    pub sync_metadata: Option<MutationSyncMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSyncedEvent {
    pub model_name: String,
    pub is_full_sync: bool,
    pub is_delta_sync: bool,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataStoreEvent {
    OutboxMutationEnqueued(OutboxMutationEvent),
    OutboxMutationProcessed(OutboxMutationEvent),
    OutboxStatus { is_empty: bool },
    ConditionalSaveFailed(MutationEvent),
    SyncReceived(MutationEvent),
    ModelSynced(ModelSyncedEvent),
    SubscriptionConnected { model_name: String },
    SubscriptionDisconnected { model_name: String, reason: DisconnectReason },
}

impl DataStoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DataStoreEvent::OutboxMutationEnqueued(_) => "outboxMutationEnqueued",
            DataStoreEvent::OutboxMutationProcessed(_) => "outboxMutationProcessed",
            DataStoreEvent::OutboxStatus { .. } => "outboxStatus",
            DataStoreEvent::ConditionalSaveFailed(_) => "conditionalSaveFailed",
            DataStoreEvent::SyncReceived(_) => "syncReceived",
            DataStoreEvent::ModelSynced(_) => "modelSynced",
            DataStoreEvent::SubscriptionConnected { .. } => "subscriptionConnected",
            DataStoreEvent::SubscriptionDisconnected { .. } => "subscriptionDisconnected",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: DataStoreEvent);
}

pub type SharedEventSink = Arc<dyn EventSink>;

/// Broadcast-backed sink; events sent with no subscribers are discarded.
pub struct Hub {
    sender: broadcast::Sender<DataStoreEvent>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataStoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventSink for Hub {
    fn dispatch(&self, event: DataStoreEvent) {
        log::trace!("Dispatching {}", event.name());
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_delivers_to_subscribers() {
        let hub = Hub::new(4);
        hub.dispatch(DataStoreEvent::OutboxStatus { is_empty: true });

        let mut receiver = hub.subscribe();
        hub.dispatch(DataStoreEvent::OutboxStatus { is_empty: false });

        assert_eq!(receiver.recv().await.unwrap(), DataStoreEvent::OutboxStatus { is_empty: false });
    }
}

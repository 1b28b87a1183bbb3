//! Sync Module - Offline-first DataStore synchronization
//!
//! Moves local changes to the cloud and remote changes into the local store:
//! - Outgoing: durable mutation log drained one event at a time, with retry,
//!   auth-type fallback and conflict handling
//! - Incoming: subscription events reconciled against pending local changes
//!   and stored sync metadata
//!
//! Architecture:
//! - Local-first: every write lands in SQLite before it is sent
//! - Versioned: the cloud assigns versions, the local store keeps the latest seen
//! - Pending local changes win over incoming remote models until delivered

pub mod api;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod graphql;
pub mod hub;
pub mod models;
pub mod mutation_log;
pub mod operation_queue;
pub mod outgoing;
pub mod reconcile_operation;
pub mod reconciler;
pub mod reconciliation_queue;
pub mod retry;
pub mod sender;
pub mod state_machine;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;


// Re-export commonly used types
pub use models::{
    AnyModel, Model,
    MutationEvent, MutationType,
    MutationSync, MutationSyncMetadata,
    ConflictData, ConflictResolution,
};

pub use engine::SyncEngine;
pub use error::{DataStoreError, DataStoreResult};
pub use config::{DataStoreConfiguration, SyncSettings, SyncExpression, ConflictHandler};
pub use api::{ApiError, AppSyncClient, AuthType, GraphQLTransport, ModelRegistry, ModelSchema, ReachabilityUpdate};
pub use graphql::{GraphQLError, GraphQLRequest, GraphQLResponse, GraphQLResponseError};
pub use hub::{DataStoreEvent, DisconnectReason, Hub, ModelSyncedEvent, OutboxMutationEvent};
pub use mutation_log::{MutationEventLog, OutboxStats};
pub use outgoing::{OutgoingMutationQueue, OutgoingMutationQueueState};
pub use reconciliation_queue::{
    incoming_event_channel, IncomingEventStream, IncomingSubscriptionEvent,
    ModelReconciliationQueue, ReconciliationQueueEvent,
};
pub use retry::{DefaultRetryPolicy, RequestRetryablePolicy, RetryConfig};
pub use storage::{SharedStorage, StorageAdapter};

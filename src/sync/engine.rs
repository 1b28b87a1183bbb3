//! Sync Engine - Wires local writes to the outgoing and incoming pipelines
//!
//! Handles:
//! - Local saves and deletes, recorded in the mutation log in the same
//!   transaction as the model write
//! - Starting, pausing and stopping delivery to the cloud
//! - Creating the reconciliation queue for live subscriptions
//! - Exposing notifications and outbox statistics

use std::slice;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::db::{Database, DbError};

use super::api::GraphQLTransport;
use super::config::{DataStoreConfiguration, SyncSettings};
use super::error::DataStoreResult;
use super::hub::{DataStoreEvent, Hub};
use super::models::{AnyModel, Model, MutationEvent, MutationType};
use super::mutation_log::{MutationEventLog, OutboxStats};
use super::outgoing::{OutgoingMutationQueue, OutgoingMutationQueueState};
use super::reconciliation_queue::{IncomingEventStream, ModelReconciliationQueue};
use super::retry::{DefaultRetryPolicy, RequestRetryablePolicy};
use super::storage::{SharedStorage, StorageAdapter};

/// Sync engine - main entry point
#[derive(Clone)]
pub struct SyncEngine {
    storage: SharedStorage,
    configuration: Arc<DataStoreConfiguration>,
    hub: Arc<Hub>,
    mutation_log: Arc<MutationEventLog>,
    outgoing: Arc<OutgoingMutationQueue>,
    reconciliation: Arc<StdMutex<Option<Arc<ModelReconciliationQueue>>>>,
    /// The outgoing queue only holds the transport weakly
    transport: Arc<StdMutex<Option<Arc<dyn GraphQLTransport>>>>,
}

impl SyncEngine {
    /// Create an engine with the default retry policy. Must be called from
    /// within a Tokio runtime.
    pub fn new(storage: SharedStorage, configuration: DataStoreConfiguration) -> DataStoreResult<Self> {
        let retry_policy = Arc::new(DefaultRetryPolicy::new(configuration.settings.retry.clone()));
        Self::with_retry_policy(storage, configuration, retry_policy)
    }

    /// Create an engine on `db` using the settings stored there, overridden by
    /// `.env` and process environment variables.
    pub fn open(db: Arc<Database>) -> DataStoreResult<Self> {
        dotenvy::dotenv().ok();
        let settings = SyncSettings::load(&db)?.with_overrides(|key| std::env::var(key).ok())?;
        Self::new(db, DataStoreConfiguration::new(settings))
    }

    pub fn with_retry_policy(
        storage: SharedStorage,
        configuration: DataStoreConfiguration,
        retry_policy: Arc<dyn RequestRetryablePolicy>,
    ) -> DataStoreResult<Self> {
        configuration.settings.validate()?;

        let configuration = Arc::new(configuration);
        let hub = Arc::new(Hub::new(configuration.settings.event_buffer_size));
        let mutation_log = MutationEventLog::shared(storage.clone())?;
        let outgoing = OutgoingMutationQueue::new(storage.clone(), configuration.clone(), retry_policy, hub.clone());

        Ok(Self {
            storage,
            configuration,
            hub,
            mutation_log,
            outgoing: Arc::new(outgoing),
            reconciliation: Arc::new(StdMutex::new(None)),
            transport: Arc::new(StdMutex::new(None)),
        })
    }

    // ========================================================================
    // Local Writes
    // ========================================================================

    /// Save a model locally and record the change for the cloud.
    pub fn save(&self, model: &AnyModel) -> DataStoreResult<Option<MutationEvent>> {
        self.save_internal(model, None)
    }

    /// Save, sending the change only if the remote record matches `condition`.
    pub fn save_with_condition(&self, model: &AnyModel, condition: &Value) -> DataStoreResult<Option<MutationEvent>> {
        self.save_internal(model, Some(condition))
    }

    pub fn save_model<M: Model>(&self, model: &M) -> DataStoreResult<Option<MutationEvent>> {
        self.save(&AnyModel::from_model(model)?)
    }

    fn save_internal(&self, model: &AnyModel, condition: Option<&Value>) -> DataStoreResult<Option<MutationEvent>> {
        let mut appended = None;
        self.storage.transaction(&mut |tx| {
            let exists = tx.query_model(&model.model_name, &model.id)?.is_some();
            let mutation_type = if exists { MutationType::Update } else { MutationType::Create };

            tx.save_model(model)?;

            let mut event = MutationEvent::new(model, mutation_type, local_version(tx, model)?)?;
            if let Some(condition) = condition {
                event = event.with_condition(condition)?;
            }
            appended = MutationEventLog::append_in(tx, &event)?;
            Ok(())
        })?;

        self.mutation_log.notify_appended();
        log::debug!("Saved {} {}", model.model_name, model.id);
        Ok(appended)
    }

    /// Delete a model locally and record the deletion for the cloud.
    pub fn delete(&self, model_name: &str, id: &str) -> DataStoreResult<Option<MutationEvent>> {
        let mut appended = None;
        self.storage.transaction(&mut |tx| {
            let model = tx
                .query_model(model_name, id)?
                .ok_or_else(|| DbError::NotFound(format!("{} {}", model_name, id)))?;

            tx.delete_model(model_name, id)?;

            let event = MutationEvent::new(&model, MutationType::Delete, local_version(tx, &model)?)?;
            appended = MutationEventLog::append_in(tx, &event)?;
            Ok(())
        })?;

        self.mutation_log.notify_appended();
        log::debug!("Deleted {} {}", model_name, id);
        Ok(appended)
    }

    pub fn query(&self, model_name: &str, id: &str) -> DataStoreResult<Option<AnyModel>> {
        Ok(self.storage.query_model(model_name, id)?)
    }

    pub fn query_as<M: Model>(&self, id: &str) -> DataStoreResult<Option<M>> {
        self.query(M::MODEL_NAME, id)?.map(|model| model.decode()).transpose()
    }

    // ========================================================================
    // Sync Control
    // ========================================================================

    /// Start (or resume) sending recorded changes through `transport`.
    pub fn start_syncing_to_cloud(&self, transport: Arc<dyn GraphQLTransport>) {
        self.outgoing
            .start_syncing_to_cloud(transport.clone(), self.mutation_log.clone());
        *lock(&self.transport) = Some(transport);
    }

    pub fn pause_syncing_to_cloud(&self) {
        self.outgoing.pause_syncing_to_cloud();
    }

    /// Create the reconciliation queue for incoming subscription streams,
    /// replacing any previous one. Call `start` on it once initial sync is done.
    pub fn reconciliation_queue(&self, streams: Vec<IncomingEventStream>) -> Arc<ModelReconciliationQueue> {
        let queue = Arc::new(ModelReconciliationQueue::new(
            streams,
            self.storage.clone(),
            self.hub.clone(),
            self.configuration.clone(),
        ));

        if let Some(previous) = lock(&self.reconciliation).replace(queue.clone()) {
            previous.cancel();
        }
        queue
    }

    /// Stop both directions. The engine cannot sync again afterwards.
    pub fn stop(&self) {
        log::info!("Stopping sync engine");
        self.outgoing.cancel();
        if let Some(queue) = lock(&self.reconciliation).take() {
            queue.cancel();
        }
        lock(&self.transport).take();
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn outbox_stats(&self) -> DataStoreResult<OutboxStats> {
        self.mutation_log.stats()
    }

    pub fn outgoing_state(&self) -> OutgoingMutationQueueState {
        self.outgoing.state()
    }

    pub fn configuration(&self) -> &DataStoreConfiguration {
        &self.configuration
    }

    /// Hub notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DataStoreEvent> {
        self.hub.subscribe()
    }

    /// Remote models applied locally while resolving outgoing conflicts
    pub fn subscribe_outgoing(&self) -> broadcast::Receiver<MutationEvent> {
        self.outgoing.subscribe()
    }
}

fn local_version(storage: &dyn StorageAdapter, model: &AnyModel) -> DataStoreResult<Option<i64>> {
    let metadata = storage.query_sync_metadata(&model.model_name, slice::from_ref(&model.id))?;
    Ok(metadata.first().map(|m| m.version))
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

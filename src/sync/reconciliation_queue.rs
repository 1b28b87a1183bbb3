//! Reconciliation queue
//!
//! Brings remote changes into local storage for one model or a group of
//! models. Two serial queues keep initial sync ahead of live traffic:
//! - the intake queue, suspended until `start`, forwards subscription events
//! - the reconcile queue, always running, applies batches one at a time
//!
//! Progress is published on a broadcast stream of `ReconciliationQueueEvent`
//! and mirrored on the notification sink.

use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::DataStoreConfiguration;
use super::error::{DataStoreError, DataStoreResult, SharedError};
use super::graphql::CloudFailure;
use super::hub::{DataStoreEvent, DisconnectReason, ModelSyncedEvent, SharedEventSink};
use super::models::{MutationEvent, MutationSync};
use super::operation_queue::OperationQueue;
use super::reconcile_operation::{ReconcileAndLocalSaveOperation, ReconcileAndLocalSaveOperationEvent, ReconcileOutcome};
use super::storage::SharedStorage;

/// One item from a model's live subscription
#[derive(Debug, Clone)]
pub enum IncomingSubscriptionEvent {
    MutationEvent(MutationSync),
    ConnectionConnected,
    Failed(CloudFailure),
}

/// Live subscription feed for one model
pub struct IncomingEventStream {
    pub model_name: String,
    pub receiver: mpsc::UnboundedReceiver<IncomingSubscriptionEvent>,
}

pub fn incoming_event_channel(
    model_name: impl Into<String>,
) -> (mpsc::UnboundedSender<IncomingSubscriptionEvent>, IncomingEventStream) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let stream = IncomingEventStream {
        model_name: model_name.into(),
        receiver,
    };
    (sender, stream)
}

#[derive(Debug, Clone)]
pub enum ReconciliationQueueEvent {
    Started,
    Paused,
    Connected { model_name: String },
    Disconnected { model_name: String, reason: DisconnectReason },
    MutationEvent(MutationEvent),
    MutationEventDropped { model_name: String, error: Option<String> },
    Failed(SharedError),
}

struct Inner {
    storage: SharedStorage,
    events: SharedEventSink,
    configuration: Arc<DataStoreConfiguration>,
    intake_queue: OperationQueue,
    reconcile_queue: OperationQueue,
    publisher: broadcast::Sender<ReconciliationQueueEvent>,
    cancelled: CancellationToken,
}

pub struct ModelReconciliationQueue {
    inner: Arc<Inner>,
    intake_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ModelReconciliationQueue {
    /// Must be called from within a Tokio runtime. Subscription events are
    /// held until `start`.
    pub fn new(
        streams: Vec<IncomingEventStream>,
        storage: SharedStorage,
        events: SharedEventSink,
        configuration: Arc<DataStoreConfiguration>,
    ) -> Self {
        let (publisher, _) = broadcast::channel(configuration.settings.event_buffer_size.max(1));
        let inner = Arc::new(Inner {
            storage,
            events,
            configuration,
            intake_queue: OperationQueue::new("reconciliation-intake", true),
            reconcile_queue: OperationQueue::new("reconcile-and-save", false),
            publisher,
            cancelled: CancellationToken::new(),
        });

        let intake_tasks = streams
            .into_iter()
            .map(|stream| tokio::spawn(Self::intake(Arc::downgrade(&inner), inner.cancelled.clone(), stream)))
            .collect();

        Self {
            inner,
            intake_tasks: StdMutex::new(intake_tasks),
        }
    }

    async fn intake(inner: Weak<Inner>, cancelled: CancellationToken, mut stream: IncomingEventStream) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancelled.cancelled() => break,
                event = stream.receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let Some(strong) = inner.upgrade() else {
                break;
            };
            let weak = inner.clone();
            let model_name = stream.model_name.clone();
            strong.intake_queue.add_operation(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.receive(&model_name, event);
                }
            });
        }
        log::debug!("Subscription intake for {} stopped", stream.model_name);
    }

    /// Let subscription events through.
    pub fn start(&self) {
        if self.inner.cancelled.is_cancelled() {
            log::warn!("Ignoring start of a cancelled reconciliation queue");
            return;
        }
        self.inner.intake_queue.set_suspended(false);
        self.inner.publish(ReconciliationQueueEvent::Started);
    }

    /// Hold subscription events. Batches already queued for reconciliation still run.
    pub fn pause(&self) {
        self.inner.intake_queue.set_suspended(true);
        self.inner.publish(ReconciliationQueueEvent::Paused);
    }

    /// Stop permanently.
    pub fn cancel(&self) {
        if self.inner.cancelled.is_cancelled() {
            return;
        }
        log::info!("Cancelling reconciliation queue");
        self.inner.cancelled.cancel();
        self.inner.intake_queue.close();
        self.inner.reconcile_queue.close();
        for task in self.intake_tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.is_cancelled()
    }

    /// Queue remote models for reconciliation, one batch per model name.
    pub fn enqueue(&self, remote_models: Vec<MutationSync>) {
        self.inner.enqueue(remote_models);
    }

    /// Reconcile an initial-sync batch ahead of any later work and report
    /// what changed.
    pub async fn reconcile_initial_sync(
        &self,
        model_name: &str,
        remote_models: Vec<MutationSync>,
        is_full_sync: bool,
    ) -> DataStoreResult<ModelSyncedEvent> {
        let (done_tx, done_rx) = oneshot::channel();
        let operation = self.inner.operation(model_name, remote_models);
        let weak = Arc::downgrade(&self.inner);

        self.inner.reconcile_queue.add_operation(async move {
            let result = operation.run().await;
            if let Some(inner) = weak.upgrade() {
                inner.publish_outcome(&result);
            }
            let _ = done_tx.send(result);
        });

        let outcome = match done_rx.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => return Err(unshare(error)),
            Err(_) => return Err(DataStoreError::Cancelled),
        };

        let synced = ModelSyncedEvent {
            model_name: model_name.to_string(),
            is_full_sync,
            is_delta_sync: !is_full_sync,
            created: outcome.created,
            updated: outcome.updated,
            deleted: outcome.deleted,
        };
        log::info!(
            "{} synced: {} created, {} updated, {} deleted",
            model_name,
            synced.created,
            synced.updated,
            synced.deleted
        );
        self.inner.events.dispatch(DataStoreEvent::ModelSynced(synced.clone()));
        Ok(synced)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconciliationQueueEvent> {
        self.inner.publisher.subscribe()
    }
}

impl Drop for ModelReconciliationQueue {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Inner {
    fn receive(self: &Arc<Self>, model_name: &str, event: IncomingSubscriptionEvent) {
        match event {
            IncomingSubscriptionEvent::MutationEvent(remote) => {
                if let Some(expression) = self.configuration.sync_expression(&remote.model.model_name) {
                    if !expression.matches(&remote.model) {
                        log::debug!(
                            "Remote {} {} does not match its sync expression",
                            remote.model.model_name,
                            remote.model_id()
                        );
                        return;
                    }
                }
                self.enqueue(vec![remote]);
            }
            IncomingSubscriptionEvent::ConnectionConnected => {
                log::info!("Subscription for {} connected", model_name);
                self.events.dispatch(DataStoreEvent::SubscriptionConnected {
                    model_name: model_name.to_string(),
                });
                self.publish(ReconciliationQueueEvent::Connected {
                    model_name: model_name.to_string(),
                });
            }
            IncomingSubscriptionEvent::Failed(failure) if failure.is_unauthorized() => {
                log::warn!("Subscription for {} is no longer authorized", model_name);
                self.events.dispatch(DataStoreEvent::SubscriptionDisconnected {
                    model_name: model_name.to_string(),
                    reason: DisconnectReason::Unauthorized,
                });
                self.publish(ReconciliationQueueEvent::Disconnected {
                    model_name: model_name.to_string(),
                    reason: DisconnectReason::Unauthorized,
                });
            }
            IncomingSubscriptionEvent::Failed(failure) => {
                let error = DataStoreError::from(failure);
                log::error!("Subscription for {} failed: {}", model_name, error);
                self.publish(ReconciliationQueueEvent::Failed(Arc::new(error)));
            }
        }
    }

    fn enqueue(self: &Arc<Self>, remote_models: Vec<MutationSync>) {
        let mut batches: Vec<(String, Vec<MutationSync>)> = Vec::new();
        for remote in remote_models {
            match batches.iter_mut().find(|(name, _)| *name == remote.model.model_name) {
                Some((_, batch)) => batch.push(remote),
                None => batches.push((remote.model.model_name.clone(), vec![remote])),
            }
        }

        for (model_name, batch) in batches {
            let operation = self.operation(&model_name, batch);
            let weak = Arc::downgrade(self);
            self.reconcile_queue.add_operation(async move {
                let result = operation.run().await;
                if let Some(inner) = weak.upgrade() {
                    inner.publish_outcome(&result);
                }
            });
        }
    }

    fn operation(&self, model_name: &str, remote_models: Vec<MutationSync>) -> ReconcileAndLocalSaveOperation {
        ReconcileAndLocalSaveOperation::new(model_name, remote_models, self.storage.clone(), self.events.clone())
            .with_cancellation(self.cancelled.child_token())
    }

    fn publish_outcome(&self, result: &Result<ReconcileOutcome, SharedError>) {
        match result {
            Ok(outcome) => {
                for event in &outcome.events {
                    self.publish(match event.clone() {
                        ReconcileAndLocalSaveOperationEvent::MutationEvent(event) => {
                            ReconciliationQueueEvent::MutationEvent(event)
                        }
                        ReconcileAndLocalSaveOperationEvent::MutationEventDropped { model_name, error } => {
                            ReconciliationQueueEvent::MutationEventDropped { model_name, error }
                        }
                    });
                }
            }
            Err(error) if error.is_cancelled() => {}
            Err(error) => self.publish(ReconciliationQueueEvent::Failed(error.clone())),
        }
    }

    fn publish(&self, event: ReconciliationQueueEvent) {
        let _ = self.publisher.send(event);
    }
}

/// Recover an owned error from a shared one where nobody else holds it.
fn unshare(error: SharedError) -> DataStoreError {
    Arc::try_unwrap(error).unwrap_or_else(|shared| match &*shared {
        DataStoreError::Cancelled => DataStoreError::Cancelled,
        other => DataStoreError::Sync(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::api::ApiError;
    use crate::sync::config::SyncExpression;
    use crate::sync::models::{AnyModel, MutationSyncMetadata, MutationType};
    use crate::sync::storage::StorageAdapter;
    use crate::sync::test_support::{error_response, eventually, FaultyStorage, RecordingEventSink};
    use serde_json::json;
    use std::time::Duration;

    fn remote(name: &str, id: &str, version: i64) -> MutationSync {
        MutationSync::new(
            AnyModel::new(name, id, json!({"id": id, "rating": version})),
            MutationSyncMetadata::new(name, id, version, false),
        )
    }

    struct Fixture {
        db: Arc<Database>,
        events: Arc<RecordingEventSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Arc::new(Database::in_memory().expect("Failed to create test database")),
                events: Arc::new(RecordingEventSink::default()),
            }
        }

        fn queue(&self, streams: Vec<IncomingEventStream>, configuration: DataStoreConfiguration) -> ModelReconciliationQueue {
            ModelReconciliationQueue::new(streams, self.db.clone(), self.events.clone(), Arc::new(configuration))
        }
    }

    async fn next_event(receiver: &mut broadcast::Receiver<ReconciliationQueueEvent>) -> ReconciliationQueueEvent {
        tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .expect("no reconciliation event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_subscription_events_wait_for_start() {
        let fixture = Fixture::new();
        let (sender, stream) = incoming_event_channel("Post");
        let queue = fixture.queue(vec![stream], DataStoreConfiguration::default());

        sender.send(IncomingSubscriptionEvent::MutationEvent(remote("Post", "a", 1))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fixture.db.query_model("Post", "a").unwrap().is_none());

        queue.start();
        let db = fixture.db.clone();
        eventually(|| db.query_model("Post", "a").unwrap().is_some()).await;
    }

    #[tokio::test]
    async fn test_enqueue_publishes_mutation_events() {
        let fixture = Fixture::new();
        let queue = fixture.queue(vec![], DataStoreConfiguration::default());
        let mut receiver = queue.subscribe();

        queue.enqueue(vec![remote("Post", "a", 1), remote("Comment", "c", 1)]);

        let mut names = Vec::new();
        for _ in 0..2 {
            match next_event(&mut receiver).await {
                ReconciliationQueueEvent::MutationEvent(event) => {
                    assert_eq!(event.mutation_type, MutationType::Create);
                    names.push(event.model_name);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(names, vec!["Post", "Comment"]);
    }

    #[tokio::test]
    async fn test_initial_sync_reports_counts() {
        let fixture = Fixture::new();
        let queue = fixture.queue(vec![], DataStoreConfiguration::default());
        queue.reconcile_initial_sync("Post", vec![remote("Post", "a", 1)], true).await.unwrap();

        let synced = queue
            .reconcile_initial_sync("Post", vec![remote("Post", "a", 2), remote("Post", "b", 1)], false)
            .await
            .unwrap();

        assert_eq!((synced.created, synced.updated, synced.deleted), (1, 1, 0));
        assert!(synced.is_delta_sync);
        assert_eq!(fixture.events.count("modelSynced"), 2);
    }

    #[tokio::test]
    async fn test_sync_expression_filters_subscription_events() {
        let fixture = Fixture::new();
        let (sender, stream) = incoming_event_channel("Post");
        let configuration = DataStoreConfiguration::default().with_sync_expression(SyncExpression::new(
            "Post",
            |model: &AnyModel| model.instance["rating"].as_i64().unwrap_or(0) > 1,
        ));
        let queue = fixture.queue(vec![stream], configuration);
        queue.start();

        sender.send(IncomingSubscriptionEvent::MutationEvent(remote("Post", "low", 1))).unwrap();
        sender.send(IncomingSubscriptionEvent::MutationEvent(remote("Post", "high", 2))).unwrap();

        let db = fixture.db.clone();
        eventually(|| db.query_model("Post", "high").unwrap().is_some()).await;
        assert!(fixture.db.query_model("Post", "low").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connection_and_unauthorized_events() {
        let fixture = Fixture::new();
        let (sender, stream) = incoming_event_channel("Post");
        let queue = fixture.queue(vec![stream], DataStoreConfiguration::default());
        let mut receiver = queue.subscribe();
        queue.start();
        assert!(matches!(next_event(&mut receiver).await, ReconciliationQueueEvent::Started));

        let unauthorized = match error_response("Unauthorized") {
            Ok(Err(error)) => error,
            _ => unreachable!(),
        };
        sender.send(IncomingSubscriptionEvent::ConnectionConnected).unwrap();
        sender
            .send(IncomingSubscriptionEvent::Failed(CloudFailure::GraphQL(unauthorized)))
            .unwrap();
        sender
            .send(IncomingSubscriptionEvent::Failed(CloudFailure::Api(ApiError::status(500))))
            .unwrap();

        assert!(matches!(
            next_event(&mut receiver).await,
            ReconciliationQueueEvent::Connected { model_name } if model_name == "Post"
        ));
        assert!(matches!(
            next_event(&mut receiver).await,
            ReconciliationQueueEvent::Disconnected { reason: DisconnectReason::Unauthorized, .. }
        ));
        assert!(matches!(next_event(&mut receiver).await, ReconciliationQueueEvent::Failed(_)));
        assert_eq!(fixture.events.count("subscriptionConnected"), 1);
        assert_eq!(fixture.events.count("subscriptionDisconnected"), 1);
    }

    #[tokio::test]
    async fn test_pending_local_change_is_published_as_dropped() {
        let fixture = Fixture::new();
        let queue = fixture.queue(vec![], DataStoreConfiguration::default());
        let mut receiver = queue.subscribe();
        let incoming = remote("Post", "a", 1);
        fixture
            .db
            .save_mutation_event(&MutationEvent::new(&incoming.model, MutationType::Create, None).unwrap())
            .unwrap();

        queue.enqueue(vec![incoming]);

        assert!(matches!(
            next_event(&mut receiver).await,
            ReconciliationQueueEvent::MutationEventDropped { error: None, .. }
        ));
        assert!(fixture.db.query_model("Post", "a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_is_published() {
        let fixture = Fixture::new();
        let storage = Arc::new(FaultyStorage::failing_model_saves(fixture.db.clone()));
        let queue = ModelReconciliationQueue::new(
            vec![],
            storage,
            fixture.events.clone(),
            Arc::new(DataStoreConfiguration::default()),
        );
        let mut receiver = queue.subscribe();

        queue.enqueue(vec![remote("Post", "a", 1)]);

        match next_event(&mut receiver).await {
            ReconciliationQueueEvent::Failed(error) => assert!(matches!(*error, DataStoreError::Storage(_))),
            other => panic!("unexpected event {:?}", other),
        }

        // The queue keeps running after a failed batch
        queue.enqueue(vec![]);
        let synced = queue.reconcile_initial_sync("Post", vec![], true).await.unwrap();
        assert_eq!(synced.created, 0);
    }

    #[tokio::test]
    async fn test_cancel_is_permanent() {
        let fixture = Fixture::new();
        let (sender, stream) = incoming_event_channel("Post");
        let queue = fixture.queue(vec![stream], DataStoreConfiguration::default());

        queue.cancel();
        queue.start();
        let _ = sender.send(IncomingSubscriptionEvent::MutationEvent(remote("Post", "a", 1)));
        queue.enqueue(vec![remote("Post", "b", 1)]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(queue.is_cancelled());
        assert!(fixture.db.query_model("Post", "a").unwrap().is_none());
        assert!(fixture.db.query_model("Post", "b").unwrap().is_none());
        assert!(matches!(
            queue.reconcile_initial_sync("Post", vec![remote("Post", "c", 1)], true).await,
            Err(DataStoreError::Cancelled)
        ));
    }
}

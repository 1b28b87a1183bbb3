//! Outgoing mutation queue
//!
//! Delivers local mutation events to the cloud strictly one at a time, in
//! the order they were recorded. Driven by a declarative state machine:
//!
//! ```text
//! NotInitialized -> NotStarted -> Starting -> RequestingEvent <-> WaitingForEventToProcess
//!                                  (start while running) -> ResumingMutationQueue -> Resumed
//! any -> Finished (cancel) | InError (lifecycle violation)
//! ```
//!
//! Each `RequestingEvent` asks the event source for exactly one event; the
//! next request is only made once that event has been processed.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::api::GraphQLTransport;
use super::config::DataStoreConfiguration;
use super::conflict::ProcessMutationErrorFromCloudOperation;
use super::error::{DataStoreError, DataStoreResult, SharedError};
use super::graphql::{CloudFailure, GraphQLResponse};
use super::hub::{DataStoreEvent, OutboxMutationEvent, SharedEventSink};
use super::models::{MutationEvent, MutationSync};
use super::mutation_log::MutationEventSource;
use super::operation_queue::OperationQueue;
use super::retry::RequestRetryablePolicy;
use super::sender::SyncMutationToCloudOperation;
use super::state_machine::StateMachine;
use super::storage::{MutationEventFilter, SharedStorage, StorageAdapter};

/// Collaborators handed over when syncing to the cloud starts or resumes
#[derive(Clone)]
pub struct StartRequest {
    pub transport: Arc<dyn GraphQLTransport>,
    pub source: Arc<dyn MutationEventSource>,
}

#[derive(Clone)]
pub enum OutgoingMutationQueueState {
    NotInitialized,
    NotStarted,
    Starting(StartRequest),
    RequestingEvent,
    WaitingForEventToProcess,
    ResumingMutationQueue(StartRequest),
    Resumed,
    Finished,
    InError(SharedError),
}

impl fmt::Debug for OutgoingMutationQueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "NotInitialized"),
            Self::NotStarted => write!(f, "NotStarted"),
            Self::Starting(_) => write!(f, "Starting"),
            Self::RequestingEvent => write!(f, "RequestingEvent"),
            Self::WaitingForEventToProcess => write!(f, "WaitingForEventToProcess"),
            Self::ResumingMutationQueue(_) => write!(f, "ResumingMutationQueue"),
            Self::Resumed => write!(f, "Resumed"),
            Self::Finished => write!(f, "Finished"),
            Self::InError(error) => write!(f, "InError({})", error),
        }
    }
}

pub enum OutgoingMutationQueueAction {
    Initialized,
    ReceivedStart(StartRequest),
    ReceivedSubscription,
    EnqueuedEvent,
    ProcessedEvent,
    ResumedSyncingToCloud,
    ReceivedCancel,
    Errored(SharedError),
}

impl fmt::Debug for OutgoingMutationQueueAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "Initialized"),
            Self::ReceivedStart(_) => write!(f, "ReceivedStart"),
            Self::ReceivedSubscription => write!(f, "ReceivedSubscription"),
            Self::EnqueuedEvent => write!(f, "EnqueuedEvent"),
            Self::ProcessedEvent => write!(f, "ProcessedEvent"),
            Self::ResumedSyncingToCloud => write!(f, "ResumedSyncingToCloud"),
            Self::ReceivedCancel => write!(f, "ReceivedCancel"),
            Self::Errored(error) => write!(f, "Errored({})", error),
        }
    }
}

pub fn resolve(state: &OutgoingMutationQueueState, action: &OutgoingMutationQueueAction) -> OutgoingMutationQueueState {
    use self::OutgoingMutationQueueAction as Action;
    use self::OutgoingMutationQueueState as State;

    match (state, action) {
        (State::Finished, _) => state.clone(),
        (_, Action::ReceivedCancel) => State::Finished,
        (State::InError(_), _) => state.clone(),
        (_, Action::Errored(error)) => State::InError(error.clone()),

        (State::NotInitialized, Action::Initialized) => State::NotStarted,
        (State::NotStarted, Action::ReceivedStart(request)) => State::Starting(request.clone()),
        (State::Starting(_), Action::ReceivedSubscription) => State::RequestingEvent,

        (State::RequestingEvent, Action::EnqueuedEvent) => State::WaitingForEventToProcess,
        (State::WaitingForEventToProcess, Action::ProcessedEvent) => State::RequestingEvent,

        (
            State::RequestingEvent | State::WaitingForEventToProcess | State::Resumed,
            Action::ReceivedStart(request),
        ) => State::ResumingMutationQueue(request.clone()),
        (State::ResumingMutationQueue(_), Action::ResumedSyncingToCloud) => State::Resumed,
        (State::ResumingMutationQueue(_) | State::Resumed, Action::ProcessedEvent) => State::RequestingEvent,
        (State::ResumingMutationQueue(_) | State::Resumed, Action::EnqueuedEvent) => State::WaitingForEventToProcess,

        _ => {
            log::warn!("Outgoing mutation queue ignoring {:?} in state {:?}", action, state);
            state.clone()
        }
    }
}

struct Subscription {
    source: Arc<dyn MutationEventSource>,
    token: CancellationToken,
}

struct Inner {
    storage: SharedStorage,
    configuration: Arc<DataStoreConfiguration>,
    retry_policy: Arc<dyn RequestRetryablePolicy>,
    events: SharedEventSink,
    state: StateMachine<OutgoingMutationQueueState, OutgoingMutationQueueAction>,
    operation_queue: OperationQueue,
    transport: StdMutex<Option<Weak<dyn GraphQLTransport>>>,
    subscription: StdMutex<Option<Subscription>>,
    publisher: broadcast::Sender<MutationEvent>,
    shutdown: CancellationToken,
}

pub struct OutgoingMutationQueue {
    inner: Arc<Inner>,
    responder: JoinHandle<()>,
}

impl OutgoingMutationQueue {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        storage: SharedStorage,
        configuration: Arc<DataStoreConfiguration>,
        retry_policy: Arc<dyn RequestRetryablePolicy>,
        events: SharedEventSink,
    ) -> Self {
        let (state, states) = StateMachine::new(OutgoingMutationQueueState::NotInitialized, resolve);
        let (publisher, _) = broadcast::channel(configuration.settings.event_buffer_size.max(1));

        let inner = Arc::new(Inner {
            storage,
            configuration,
            retry_policy,
            events,
            state,
            operation_queue: OperationQueue::new("outgoing-mutations", true),
            transport: StdMutex::new(None),
            subscription: StdMutex::new(None),
            publisher,
            shutdown: CancellationToken::new(),
        });

        let responder = tokio::spawn(Self::respond(Arc::downgrade(&inner), states));
        inner.state.notify(OutgoingMutationQueueAction::Initialized);

        Self { inner, responder }
    }

    async fn respond(inner: Weak<Inner>, mut states: mpsc::UnboundedReceiver<OutgoingMutationQueueState>) {
        while let Some(state) = states.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.respond_to(state);
        }
    }

    /// Start, or resume after a pause. A resume adopts the given transport
    /// and source for every later send.
    pub fn start_syncing_to_cloud(&self, transport: Arc<dyn GraphQLTransport>, source: Arc<dyn MutationEventSource>) {
        self.inner
            .state
            .notify(OutgoingMutationQueueAction::ReceivedStart(StartRequest { transport, source }));

        // Adopt right away so the caller may release the previous transport
        if let OutgoingMutationQueueState::ResumingMutationQueue(request) = self.inner.state.state() {
            self.inner.adopt(request);
        }
    }

    /// Hold queued sends. A send already in flight still completes.
    pub fn pause_syncing_to_cloud(&self) {
        log::info!("Pausing outgoing mutation queue");
        self.inner.operation_queue.set_suspended(true);
    }

    /// Stop permanently, cancelling queued and in-flight sends.
    pub fn cancel(&self) {
        log::info!("Cancelling outgoing mutation queue");
        self.inner.shutdown.cancel();
        self.inner.operation_queue.close();
        self.inner.state.notify(OutgoingMutationQueueAction::ReceivedCancel);
    }

    pub fn state(&self) -> OutgoingMutationQueueState {
        self.inner.state.state()
    }

    /// Remote models applied locally while resolving conflicts
    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.inner.publisher.subscribe()
    }
}

impl Drop for OutgoingMutationQueue {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.operation_queue.close();
        self.responder.abort();
    }
}

impl Inner {
    fn respond_to(self: &Arc<Self>, state: OutgoingMutationQueueState) {
        match state {
            OutgoingMutationQueueState::NotInitialized
            | OutgoingMutationQueueState::WaitingForEventToProcess
            | OutgoingMutationQueueState::Resumed => {}
            OutgoingMutationQueueState::NotStarted => log::debug!("Outgoing mutation queue initialized"),
            OutgoingMutationQueueState::Starting(request) => self.start(request),
            OutgoingMutationQueueState::RequestingEvent => self.request_event(),
            OutgoingMutationQueueState::ResumingMutationQueue(request) => {
                log::info!("Resuming outgoing mutation queue");
                self.adopt(request);
                self.operation_queue.set_suspended(false);
                self.state.notify(OutgoingMutationQueueAction::ResumedSyncingToCloud);
            }
            OutgoingMutationQueueState::Finished => {
                self.end_subscription();
                log::info!("Outgoing mutation queue finished");
            }
            OutgoingMutationQueueState::InError(error) => {
                self.end_subscription();
                log::error!("Outgoing mutation queue stopped: {}", error);
            }
        }
    }

    fn start(&self, request: StartRequest) {
        log::info!("Starting outgoing mutation queue");
        *lock(&self.transport) = Some(Arc::downgrade(&request.transport));

        self.publish_outbox_status();
        self.operation_queue.set_suspended(false);

        *lock(&self.subscription) = Some(Subscription {
            source: request.source,
            token: self.shutdown.child_token(),
        });
        self.state.notify(OutgoingMutationQueueAction::ReceivedSubscription);
    }

    /// Swap in the collaborators of a later start. A request already made
    /// to the old source still delivers its event.
    fn adopt(&self, request: StartRequest) {
        *lock(&self.transport) = Some(Arc::downgrade(&request.transport));
        if let Some(subscription) = lock(&self.subscription).as_mut() {
            subscription.source = request.source;
        }
    }

    /// Ask the source for exactly one event.
    fn request_event(self: &Arc<Self>) {
        let subscription = lock(&self.subscription)
            .as_ref()
            .map(|subscription| (subscription.source.clone(), subscription.token.clone()));
        let Some((source, token)) = subscription else {
            self.state.notify(OutgoingMutationQueueAction::Errored(Arc::new(DataStoreError::Internal(
                "Requested a mutation event without a subscription".to_string(),
            ))));
            return;
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = source.next_event() => result,
            };

            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(event) => inner.enqueue(event),
                Err(e) => inner.state.notify(OutgoingMutationQueueAction::Errored(Arc::new(e))),
            }
        });
    }

    fn enqueue(self: &Arc<Self>, event: MutationEvent) {
        let Some(transport) = lock(&self.transport).as_ref().and_then(Weak::upgrade) else {
            self.state.notify(OutgoingMutationQueueAction::Errored(Arc::new(DataStoreError::Internal(
                "GraphQL transport released while syncing to cloud".to_string(),
            ))));
            return;
        };

        log::debug!(
            "Enqueueing {} for {} {}",
            event.mutation_type.as_str(),
            event.model_name,
            event.model_id
        );
        match event.decode_model() {
            Ok(model) => self.events.dispatch(DataStoreEvent::OutboxMutationEnqueued(OutboxMutationEvent {
                model_name: event.model_name.clone(),
                model,
                sync_metadata: None,
            })),
            Err(e) => log::warn!("Mutation event {} has an unreadable payload: {}", event.id, e),
        }
        self.events.dispatch(DataStoreEvent::OutboxStatus { is_empty: false });

        let token = self.operation_queue.cancellation_token();
        let sender = SyncMutationToCloudOperation::new(
            event.clone(),
            transport.clone(),
            self.configuration.auth_types_for(&event.model_name),
            self.retry_policy.clone(),
        )
        .with_cancellation(token.child_token());
        let weak = Arc::downgrade(self);

        // Record the transition before the work can possibly complete
        self.state.notify(OutgoingMutationQueueAction::EnqueuedEvent);
        self.operation_queue.add_operation(async move {
            let result = sender.run().await;
            if let Some(inner) = weak.upgrade() {
                inner.process(event, result, transport, token).await;
            }
        });
    }

    async fn process(
        &self,
        event: MutationEvent,
        result: Result<GraphQLResponse, DataStoreError>,
        transport: Arc<dyn GraphQLTransport>,
        token: CancellationToken,
    ) {
        let failure = match result {
            Ok(Ok(mutation_sync)) => return self.complete(&event, Some(mutation_sync)),
            Ok(Err(response_error)) => CloudFailure::GraphQL(response_error),
            Err(DataStoreError::Api(api_error)) => CloudFailure::Api(api_error),
            Err(DataStoreError::Cancelled) => {
                log::debug!("Send of mutation event {} cancelled", event.id);
                return;
            }
            Err(e) => {
                log::error!("Failed to send mutation event {}: {}", event.id, e);
                self.configuration.handle_error(e);
                return self.complete(&event, None);
            }
        };

        let processor = ProcessMutationErrorFromCloudOperation::new(
            self.configuration.clone(),
            event.clone(),
            failure,
            transport,
            self.storage.clone(),
            self.events.clone(),
            self.retry_policy.clone(),
        )
        .with_cancellation(token.child_token());

        match processor.run().await {
            Ok(Some(applied)) => {
                let _ = self.publisher.send(applied);
            }
            Ok(None) => {}
            Err(DataStoreError::Cancelled) => return,
            Err(e) => {
                log::error!("Failed to process error for mutation event {}: {}", event.id, e);
                self.configuration.handle_error(e);
            }
        }
        self.complete(&event, None);
    }

    fn complete(&self, event: &MutationEvent, mutation_sync: Option<MutationSync>) {
        if let Some(mutation_sync) = &mutation_sync {
            let acknowledged = self
                .storage
                .transaction(&mut |tx| record_acknowledgement(tx, mutation_sync));
            if let Err(e) = acknowledged {
                log::warn!(
                    "Failed to record acknowledged version {} of {} {}: {}",
                    mutation_sync.version(),
                    event.model_name,
                    event.model_id,
                    e
                );
            }
        }

        if let Err(e) = self.storage.delete_mutation_event(&event.id) {
            log::warn!("Failed to delete processed mutation event {}: {}", event.id, e);
        }

        if let Some(mutation_sync) = mutation_sync {
            self.events.dispatch(DataStoreEvent::OutboxMutationProcessed(OutboxMutationEvent {
                model_name: event.model_name.clone(),
                model: mutation_sync.model,
                sync_metadata: Some(mutation_sync.sync_metadata),
            }));
        }

        self.publish_outbox_status();
        self.state.notify(OutgoingMutationQueueAction::ProcessedEvent);
    }

    fn publish_outbox_status(&self) {
        match self.storage.query_mutation_events(&MutationEventFilter::pending()) {
            Ok(events) => self.events.dispatch(DataStoreEvent::OutboxStatus {
                is_empty: events.is_empty(),
            }),
            Err(e) => log::warn!("Failed to read outbox status: {}", e),
        }
    }

    fn end_subscription(&self) {
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.token.cancel();
        }
    }
}

/// Store the service's copy of a sent model. Metadata only moves forward,
/// and the model is left alone while a newer local change is pending.
pub(crate) fn record_acknowledgement(tx: &dyn StorageAdapter, acknowledged: &MutationSync) -> DataStoreResult<()> {
    let model_ids = [acknowledged.model_id().to_string()];
    let stored = tx.query_sync_metadata(&acknowledged.model.model_name, &model_ids)?;
    if stored.iter().any(|metadata| metadata.version >= acknowledged.version()) {
        log::debug!(
            "Acknowledged version {} of {} {} is not newer than the stored one",
            acknowledged.version(),
            acknowledged.model.model_name,
            acknowledged.model_id()
        );
        return Ok(());
    }

    tx.save_sync_metadata(&acknowledged.sync_metadata)?;

    let pending = tx.query_mutation_events(&MutationEventFilter::pending_for(&acknowledged.model.model_name, &model_ids))?;
    if !acknowledged.is_deleted() && pending.is_empty() {
        tx.save_model(&acknowledged.model)?;
    }
    Ok(())
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

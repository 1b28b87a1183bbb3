//! Shared fakes for sync tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Notify};

use crate::db::{Database, DbError, DbResult};

use super::api::{ApiError, GraphQLTransport, ReachabilityUpdate};
use super::error::DataStoreResult;
use super::graphql::{GraphQLError, GraphQLRequest, GraphQLResponse, GraphQLResponseError};
use super::hub::{DataStoreEvent, EventSink};
use super::models::{AnyModel, MutationEvent, MutationSync, MutationSyncMetadata, MutationType, VERSION_FIELD};
use super::retry::{RequestRetryAdvice, RequestRetryablePolicy, RetryTrigger};
use super::storage::{MutationEventFilter, StorageAdapter, TransactionBody};

const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

type TransportResult = Result<GraphQLResponse, ApiError>;
type Responder = Box<dyn Fn(&GraphQLRequest) -> TransportResult + Send + Sync>;

/// Service that accepts every mutation and bumps the version.
pub(crate) fn accept_request(request: &GraphQLRequest) -> TransportResult {
    let mut instance = request.input.as_object().cloned().unwrap_or_default();
    instance.remove(VERSION_FIELD);
    let id = request.model_id().unwrap_or_default().to_string();
    let version = request.version().map_or(1, |version| version + 1);
    let deleted = request.mutation_type == MutationType::Delete;

    Ok(Ok(MutationSync::new(
        AnyModel::new(&request.model_name, id.clone(), Value::Object(instance)),
        MutationSyncMetadata::new(&request.model_name, id, version, deleted),
    )))
}

pub(crate) fn error_response(error_type: &str) -> TransportResult {
    let mut extensions = Map::new();
    extensions.insert("errorType".to_string(), json!(error_type));
    Ok(Err(GraphQLResponseError::Error(vec![
        GraphQLError::new(format!("{} raised", error_type)).with_extensions(extensions),
    ])))
}

/// `ConflictUnhandled` carrying the remote model
pub(crate) fn conflict_response(remote: &MutationSync) -> TransportResult {
    let mut extensions = Map::new();
    extensions.insert("errorType".to_string(), json!("ConflictUnhandled"));
    extensions.insert("data".to_string(), remote.to_graphql_value());
    Ok(Err(GraphQLResponseError::Error(vec![
        GraphQLError::new("Conflict resolver rejects mutation.").with_extensions(extensions),
    ])))
}

pub(crate) struct MockTransport {
    responder: Responder,
    script: Mutex<VecDeque<TransportResult>>,
    requests: Mutex<Vec<GraphQLRequest>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    reachability: Option<watch::Receiver<ReachabilityUpdate>>,
    received: Notify,
}

impl MockTransport {
    pub fn new(responder: impl Fn(&GraphQLRequest) -> TransportResult + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            reachability: None,
            received: Notify::new(),
        }
    }

    /// Answers used, in order, before falling back to the responder
    pub fn with_script(self, script: Vec<TransportResult>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    pub fn with_reachability(mut self, reachability: watch::Receiver<ReachabilityUpdate>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn requests(&self) -> Vec<GraphQLRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_for_requests(&self, count: usize) {
        let waiting = async {
            loop {
                let received = self.received.notified();
                tokio::pin!(received);
                received.as_mut().enable();

                if self.request_count() >= count {
                    return;
                }
                received.await;
            }
        };
        tokio::time::timeout(WAIT_TIMEOUT, waiting)
            .await
            .unwrap_or_else(|_| panic!("expected {} request(s), saw {}", count, self.request_count()));
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GraphQLTransport for MockTransport {
    async fn mutate(&self, request: GraphQLRequest) -> TransportResult {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        self.requests.lock().unwrap().push(request.clone());
        self.received.notify_waiters();

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| (self.responder)(&request))
    }

    fn reachability(&self) -> Option<watch::Receiver<ReachabilityUpdate>> {
        self.reachability.clone()
    }
}

/// Hands out scripted advice, then a fixed fallback
pub(crate) struct ScriptedRetryPolicy {
    script: Mutex<VecDeque<RequestRetryAdvice>>,
    fallback: RequestRetryAdvice,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedRetryPolicy {
    pub fn new(script: Vec<RequestRetryAdvice>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: RequestRetryAdvice::no_retry(Duration::ZERO),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn never() -> Self {
        Self::new(Vec::new())
    }

    pub fn always(interval: Duration) -> Self {
        Self {
            fallback: RequestRetryAdvice::retry_after(interval),
            ..Self::never()
        }
    }

    pub fn attempts_seen(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }
}

impl RequestRetryablePolicy for ScriptedRetryPolicy {
    fn retry_request_advice(&self, _trigger: &RetryTrigger, attempt_number: u32) -> RequestRetryAdvice {
        self.attempts.lock().unwrap().push(attempt_number);
        self.script.lock().unwrap().pop_front().unwrap_or(self.fallback)
    }
}

#[derive(Default)]
pub(crate) struct RecordingEventSink {
    events: Mutex<Vec<DataStoreEvent>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<DataStoreEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn sync_received(&self) -> Vec<MutationEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                DataStoreEvent::SyncReceived(mutation_event) => Some(mutation_event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|event| event.name() == name).count()
    }
}

impl EventSink for RecordingEventSink {
    fn dispatch(&self, event: DataStoreEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Database wrapper that can fail selected writes, inside transactions too
pub(crate) struct FaultyStorage {
    inner: Arc<Database>,
    faults: Faults,
}

#[derive(Clone, Copy, Default)]
struct Faults {
    model_saves: bool,
    event_deletes: bool,
}

impl FaultyStorage {
    pub fn failing_model_saves(inner: Arc<Database>) -> Self {
        Self {
            inner,
            faults: Faults {
                model_saves: true,
                ..Faults::default()
            },
        }
    }

    pub fn failing_event_deletes(inner: Arc<Database>) -> Self {
        Self {
            inner,
            faults: Faults {
                event_deletes: true,
                ..Faults::default()
            },
        }
    }
}

fn injected_failure(what: &str) -> DbError {
    DbError::Serialization(format!("injected {} failure", what))
}

/// Adapter calls with the configured faults applied
struct FaultyTx<'a> {
    inner: &'a dyn StorageAdapter,
    faults: Faults,
}

impl StorageAdapter for FaultyTx<'_> {
    fn save_model(&self, model: &AnyModel) -> DbResult<AnyModel> {
        if self.faults.model_saves {
            return Err(injected_failure("model save"));
        }
        self.inner.save_model(model)
    }

    fn delete_model(&self, model_name: &str, id: &str) -> DbResult<()> {
        self.inner.delete_model(model_name, id)
    }

    fn query_model(&self, model_name: &str, id: &str) -> DbResult<Option<AnyModel>> {
        self.inner.query_model(model_name, id)
    }

    fn query_models(&self, model_name: &str) -> DbResult<Vec<AnyModel>> {
        self.inner.query_models(model_name)
    }

    fn save_mutation_event(&self, event: &MutationEvent) -> DbResult<MutationEvent> {
        self.inner.save_mutation_event(event)
    }

    fn delete_mutation_event(&self, id: &str) -> DbResult<()> {
        if self.faults.event_deletes {
            return Err(injected_failure("mutation event delete"));
        }
        self.inner.delete_mutation_event(id)
    }

    fn query_mutation_events(&self, filter: &MutationEventFilter) -> DbResult<Vec<MutationEvent>> {
        self.inner.query_mutation_events(filter)
    }

    fn save_sync_metadata(&self, metadata: &MutationSyncMetadata) -> DbResult<MutationSyncMetadata> {
        self.inner.save_sync_metadata(metadata)
    }

    fn query_sync_metadata(&self, model_name: &str, model_ids: &[String]) -> DbResult<Vec<MutationSyncMetadata>> {
        self.inner.query_sync_metadata(model_name, model_ids)
    }

    fn transaction(&self, body: &mut TransactionBody<'_>) -> DataStoreResult<()> {
        body(self)
    }
}

impl FaultyStorage {
    fn faulty(&self) -> FaultyTx<'_> {
        FaultyTx {
            inner: &*self.inner,
            faults: self.faults,
        }
    }
}

impl StorageAdapter for FaultyStorage {
    fn save_model(&self, model: &AnyModel) -> DbResult<AnyModel> {
        self.faulty().save_model(model)
    }

    fn delete_model(&self, model_name: &str, id: &str) -> DbResult<()> {
        self.faulty().delete_model(model_name, id)
    }

    fn query_model(&self, model_name: &str, id: &str) -> DbResult<Option<AnyModel>> {
        self.faulty().query_model(model_name, id)
    }

    fn query_models(&self, model_name: &str) -> DbResult<Vec<AnyModel>> {
        self.faulty().query_models(model_name)
    }

    fn save_mutation_event(&self, event: &MutationEvent) -> DbResult<MutationEvent> {
        self.faulty().save_mutation_event(event)
    }

    fn delete_mutation_event(&self, id: &str) -> DbResult<()> {
        self.faulty().delete_mutation_event(id)
    }

    fn query_mutation_events(&self, filter: &MutationEventFilter) -> DbResult<Vec<MutationEvent>> {
        self.faulty().query_mutation_events(filter)
    }

    fn save_sync_metadata(&self, metadata: &MutationSyncMetadata) -> DbResult<MutationSyncMetadata> {
        self.faulty().save_sync_metadata(metadata)
    }

    fn query_sync_metadata(&self, model_name: &str, model_ids: &[String]) -> DbResult<Vec<MutationSyncMetadata>> {
        self.faulty().query_sync_metadata(model_name, model_ids)
    }

    fn transaction(&self, body: &mut TransactionBody<'_>) -> DataStoreResult<()> {
        let faults = self.faults;
        self.inner.transaction(&mut |tx: &dyn StorageAdapter| body(&FaultyTx { inner: tx, faults }))
    }
}

/// Poll `condition` until it holds, panicking after a timeout.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(WAIT_TIMEOUT, polling).await.is_err() {
        panic!("condition not reached within {:?}", WAIT_TIMEOUT);
    }
}

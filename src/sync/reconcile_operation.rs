//! Reconcile-and-save operation
//!
//! Applies one batch of remote models to local storage:
//! 1. drops remote models that have a pending local mutation
//! 2. computes a disposition per remaining model from the stored metadata
//! 3. applies all dispositions in one storage transaction
//! 4. publishes a sync-received notification per applied model
//!
//! Driven by its own state machine:
//! `Waiting -> Reconciling(batch) -> Finished | InError`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::DbResult;

use super::error::{DataStoreError, DataStoreResult, SharedError};
use super::hub::{DataStoreEvent, SharedEventSink};
use super::models::{MutationEvent, MutationSync, MutationType};
use super::reconciler::{Disposition, RemoteSyncReconciler};
use super::state_machine::StateMachine;
use super::storage::{MutationEventFilter, SharedStorage, StorageAdapter};

#[derive(Clone)]
pub enum ReconcileState {
    Waiting,
    Reconciling(Vec<MutationSync>),
    Finished,
    InError(SharedError),
}

impl fmt::Debug for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileState::Waiting => write!(f, "Waiting"),
            ReconcileState::Reconciling(models) => write!(f, "Reconciling({} models)", models.len()),
            ReconcileState::Finished => write!(f, "Finished"),
            ReconcileState::InError(error) => write!(f, "InError({})", error),
        }
    }
}

pub enum ReconcileAction {
    Started(Vec<MutationSync>),
    Reconciled,
    Errored(SharedError),
}

impl fmt::Debug for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::Started(models) => write!(f, "Started({} models)", models.len()),
            ReconcileAction::Reconciled => write!(f, "Reconciled"),
            ReconcileAction::Errored(error) => write!(f, "Errored({})", error),
        }
    }
}

fn resolve(state: &ReconcileState, action: &ReconcileAction) -> ReconcileState {
    match (state, action) {
        (ReconcileState::Finished | ReconcileState::InError(_), _) => state.clone(),
        (_, ReconcileAction::Errored(error)) => ReconcileState::InError(error.clone()),
        (ReconcileState::Waiting, ReconcileAction::Started(models)) => ReconcileState::Reconciling(models.clone()),
        (ReconcileState::Reconciling(_), ReconcileAction::Reconciled) => ReconcileState::Finished,
        _ => {
            log::warn!("Reconcile operation ignoring {:?} in state {:?}", action, state);
            state.clone()
        }
    }
}

/// Published by the reconciliation queue for each remote model handled
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAndLocalSaveOperationEvent {
    MutationEvent(MutationEvent),
    MutationEventDropped { model_name: String, error: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub events: Vec<ReconcileAndLocalSaveOperationEvent>,
}

impl ReconcileOutcome {
    pub fn dropped(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ReconcileAndLocalSaveOperationEvent::MutationEventDropped { .. }))
            .count()
    }
}

pub struct ReconcileAndLocalSaveOperation {
    model_name: String,
    remote_models: StdMutex<Vec<MutationSync>>,
    storage: SharedStorage,
    events: SharedEventSink,
    state: StateMachine<ReconcileState, ReconcileAction>,
    states: StdMutex<Option<mpsc::UnboundedReceiver<ReconcileState>>>,
    cancel: CancellationToken,
    finished: AtomicBool,
}

impl ReconcileAndLocalSaveOperation {
    pub fn new(
        model_name: impl Into<String>,
        remote_models: Vec<MutationSync>,
        storage: SharedStorage,
        events: SharedEventSink,
    ) -> Self {
        let (state, states) = StateMachine::new(ReconcileState::Waiting, resolve);
        Self {
            model_name: model_name.into(),
            remote_models: StdMutex::new(remote_models),
            storage,
            events,
            state,
            states: StdMutex::new(Some(states)),
            cancel: CancellationToken::new(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// No effect once the operation has finished.
    pub fn cancel(&self) {
        if !self.finished.load(Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    pub fn state(&self) -> ReconcileState {
        self.state.state()
    }

    /// Reconcile the batch. Can run once.
    pub async fn run(&self) -> Result<ReconcileOutcome, SharedError> {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Arc::new(DataStoreError::Internal("reconcile operation already ran".to_string())))?;
        let remote_models = std::mem::take(&mut *self.remote_models.lock().unwrap_or_else(|e| e.into_inner()));

        self.state.notify(ReconcileAction::Started(remote_models));

        let mut outcome = None;
        while let Some(state) = states.recv().await {
            match state {
                ReconcileState::Waiting => {}
                ReconcileState::Reconciling(models) => match self.reconcile(models) {
                    Ok(reconciled) => {
                        outcome = Some(reconciled);
                        self.state.notify(ReconcileAction::Reconciled);
                    }
                    Err(e) => self.state.notify(ReconcileAction::Errored(Arc::new(e))),
                },
                ReconcileState::Finished => return self.finish(outcome.take().unwrap_or_default()),
                ReconcileState::InError(error) => {
                    self.finished.store(true, Ordering::SeqCst);
                    if !error.is_cancelled() {
                        log::error!("Failed to reconcile {} batch: {}", self.model_name, error);
                    }
                    return Err(error);
                }
            }
        }

        Err(Arc::new(DataStoreError::Internal("reconcile state stream closed".to_string())))
    }

    fn reconcile(&self, remote_models: Vec<MutationSync>) -> DataStoreResult<ReconcileOutcome> {
        self.check_cancelled()?;

        let mut outcome = ReconcileOutcome::default();
        if remote_models.is_empty() {
            return Ok(outcome);
        }

        let ids: Vec<String> = remote_models.iter().map(|m| m.model_id().to_string()).collect();
        let pending = self
            .storage
            .query_mutation_events(&MutationEventFilter::pending_for(&self.model_name, &ids))?;
        let (remote_models, pending_dropped) = RemoteSyncReconciler::filter(remote_models, &pending);
        for remote in &pending_dropped {
            log::debug!(
                "Dropping remote {} {}: local change pending",
                remote.model.model_name,
                remote.model_id()
            );
            outcome.events.push(self.dropped(None));
        }

        let ids: Vec<String> = remote_models.iter().map(|m| m.model_id().to_string()).collect();
        let metadata = if ids.is_empty() {
            Vec::new()
        } else {
            self.storage.query_sync_metadata(&self.model_name, &ids)?
        };
        let (dispositions, stale) = RemoteSyncReconciler::dispositions(remote_models, &metadata);
        outcome.events.extend(stale.iter().map(|_| self.dropped(None)));

        self.check_cancelled()?;

        let mut applied: Vec<Disposition> = Vec::new();
        let mut ignored: Vec<String> = Vec::new();
        self.storage.transaction(&mut |tx| {
            applied.clear();
            ignored.clear();
            for disposition in &dispositions {
                match apply(tx, disposition) {
                    Ok(()) => applied.push(disposition.clone()),
                    Err(e) if tx.should_ignore_error(&e) => {
                        log::debug!(
                            "Dropping remote {} {}: {}",
                            disposition.remote_model().model.model_name,
                            disposition.remote_model().model_id(),
                            e
                        );
                        ignored.push(e.to_string());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })?;

        outcome.events.extend(ignored.into_iter().map(|error| self.dropped(Some(error))));
        for disposition in &applied {
            let (mutation_type, remote) = match disposition {
                Disposition::Create(remote) => {
                    outcome.created += 1;
                    (MutationType::Create, remote)
                }
                Disposition::Update(remote) => {
                    outcome.updated += 1;
                    (MutationType::Update, remote)
                }
                Disposition::Delete(remote) => {
                    outcome.deleted += 1;
                    (MutationType::Delete, remote)
                }
            };
            let event = MutationEvent::new(&remote.model, mutation_type, Some(remote.version()))?;
            outcome.events.push(ReconcileAndLocalSaveOperationEvent::MutationEvent(event));
        }

        log::debug!(
            "Reconciled {} batch: {} created, {} updated, {} deleted, {} dropped",
            self.model_name,
            outcome.created,
            outcome.updated,
            outcome.deleted,
            outcome.dropped()
        );
        Ok(outcome)
    }

    /// Notifications go out once, and never for a cancelled batch.
    fn finish(&self, outcome: ReconcileOutcome) -> Result<ReconcileOutcome, SharedError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(Arc::new(DataStoreError::Internal("reconcile operation already finished".to_string())));
        }
        if self.cancel.is_cancelled() {
            return Err(Arc::new(DataStoreError::Cancelled));
        }

        for event in &outcome.events {
            if let ReconcileAndLocalSaveOperationEvent::MutationEvent(mutation_event) = event {
                self.events.dispatch(DataStoreEvent::SyncReceived(mutation_event.clone()));
            }
        }
        Ok(outcome)
    }

    fn dropped(&self, error: Option<String>) -> ReconcileAndLocalSaveOperationEvent {
        ReconcileAndLocalSaveOperationEvent::MutationEventDropped {
            model_name: self.model_name.clone(),
            error,
        }
    }

    fn check_cancelled(&self) -> DataStoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DataStoreError::Cancelled);
        }
        Ok(())
    }
}

fn apply(storage: &dyn StorageAdapter, disposition: &Disposition) -> DbResult<()> {
    match disposition {
        Disposition::Create(remote) | Disposition::Update(remote) => {
            storage.save_model(&remote.model)?;
            storage.save_sync_metadata(&remote.sync_metadata)?;
        }
        Disposition::Delete(remote) => {
            storage.delete_model(&remote.model.model_name, remote.model_id())?;
            storage.save_sync_metadata(&remote.sync_metadata)?;
        }
    }
    Ok(())
}

//! Conflict processing for definitive mutation failures
//!
//! Inspects the error returned for a mutation and decides what happens to
//! the local change:
//! - API errors go to the caller's error handler and the change is dropped
//! - `ConditionalCheckFailedException` dispatches a conditional-save-failed event
//! - `ConflictUnhandled` consults the conflict handler and then applies the
//!   remote model locally or re-sends a local value at the remote version
//! - `Unauthorized`, `OperationDisabled` and unknown types are dropped
//!
//! Re-sends go through the sender once; their failures are reported to the
//! error handler and never re-enter conflict processing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::api::{ApiError, GraphQLTransport};
use super::config::DataStoreConfiguration;
use super::error::{DataStoreError, DataStoreResult};
use super::graphql::{AppSyncErrorType, CloudFailure, GraphQLError, GraphQLResponseError};
use super::hub::{DataStoreEvent, SharedEventSink};
use super::models::{AnyModel, ConflictData, ConflictResolution, MutationEvent, MutationSync, MutationType};
use super::outgoing::record_acknowledgement;
use super::retry::RequestRetryablePolicy;
use super::sender::SyncMutationToCloudOperation;
use super::storage::SharedStorage;

pub struct ProcessMutationErrorFromCloudOperation {
    configuration: Arc<DataStoreConfiguration>,
    mutation_event: MutationEvent,
    failure: CloudFailure,
    transport: Arc<dyn GraphQLTransport>,
    storage: SharedStorage,
    events: SharedEventSink,
    retry_policy: Arc<dyn RequestRetryablePolicy>,
    cancel: CancellationToken,
}

impl ProcessMutationErrorFromCloudOperation {
    pub fn new(
        configuration: Arc<DataStoreConfiguration>,
        mutation_event: MutationEvent,
        failure: CloudFailure,
        transport: Arc<dyn GraphQLTransport>,
        storage: SharedStorage,
        events: SharedEventSink,
        retry_policy: Arc<dyn RequestRetryablePolicy>,
    ) -> Self {
        Self {
            configuration,
            mutation_event,
            failure,
            transport,
            storage,
            events,
            retry_policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns the event describing a remote model applied locally, if any.
    pub async fn run(&self) -> DataStoreResult<Option<MutationEvent>> {
        self.check_cancelled()?;

        let response_error = match &self.failure {
            CloudFailure::Api(error) => {
                if matches!(error, ApiError::SignedOut) {
                    log::warn!(
                        "Signed out while syncing {} {}; dropping the mutation",
                        self.mutation_event.model_name,
                        self.mutation_event.model_id
                    );
                } else {
                    log::debug!("Dropping mutation after API error: {}", error);
                }
                self.configuration.handle_error(DataStoreError::Api(error.clone()));
                return Ok(None);
            }
            CloudFailure::GraphQL(error) => error,
        };

        let errors = match response_error {
            GraphQLResponseError::Error(errors) => errors,
            other => {
                log::warn!("Dropping mutation after unexpected response: {}", other);
                return Ok(None);
            }
        };

        if errors.len() != 1 {
            log::error!("Expected exactly one GraphQL error, received {}", errors.len());
            return Ok(None);
        }

        let error = &errors[0];
        let Some(error_type) = error.error_type() else {
            log::error!("GraphQL error without an errorType extension: {}", error.message);
            return Ok(None);
        };

        match error_type {
            AppSyncErrorType::ConditionalCheck => {
                self.events
                    .dispatch(DataStoreEvent::ConditionalSaveFailed(self.mutation_event.clone()));
                Ok(None)
            }
            AppSyncErrorType::ConflictUnhandled => self.process_conflict_unhandled(error).await,
            AppSyncErrorType::Unauthorized => {
                log::warn!(
                    "Not authorized to {} {} {}",
                    self.mutation_event.mutation_type.as_str(),
                    self.mutation_event.model_name,
                    self.mutation_event.model_id
                );
                Ok(None)
            }
            AppSyncErrorType::OperationDisabled => {
                log::warn!("Operation disabled for {}", self.mutation_event.model_name);
                Ok(None)
            }
            AppSyncErrorType::Unknown(error_type) => {
                log::warn!("Dropping mutation after unhandled error type {}", error_type);
                Ok(None)
            }
        }
    }

    async fn process_conflict_unhandled(&self, error: &GraphQLError) -> DataStoreResult<Option<MutationEvent>> {
        let data = error
            .extensions
            .as_ref()
            .and_then(|extensions| extensions.get("data"))
            .filter(|data| data.is_object())
            .ok_or_else(|| DataStoreError::Decoding("Conflict error is missing the remote model".to_string()))?;
        let remote = MutationSync::from_graphql_value(data, &self.mutation_event.model_name)?;

        match self.mutation_event.mutation_type {
            MutationType::Create => Err(DataStoreError::Internal(format!(
                "Received ConflictUnhandled for a create of {} {}",
                self.mutation_event.model_name, self.mutation_event.model_id
            ))),
            MutationType::Delete if remote.is_deleted() => {
                log::debug!(
                    "{} {} is already deleted remotely",
                    remote.model.model_name,
                    remote.model.id
                );
                Ok(None)
            }
            MutationType::Update if remote.is_deleted() => self.apply_remote_delete(&remote).map(Some),
            MutationType::Delete | MutationType::Update => {
                let local = self.mutation_event.decode_model()?;
                self.resolve_conflict(local, remote).await
            }
        }
    }

    async fn resolve_conflict(&self, local: AnyModel, remote: MutationSync) -> DataStoreResult<Option<MutationEvent>> {
        let conflict = ConflictData {
            local: local.clone(),
            remote: remote.model.clone(),
        };

        let resolution = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DataStoreError::Cancelled),
            resolution = self.configuration.conflict_handler.resolve(conflict) => resolution,
        };
        self.check_cancelled()?;

        log::debug!(
            "Conflict on {} {} resolved with {}",
            remote.model.model_name,
            remote.model.id,
            resolution_name(&resolution)
        );

        match resolution {
            ConflictResolution::ApplyRemote => self.apply_remote(&remote).map(Some),
            ConflictResolution::RetryLocal => {
                self.send_retry(&local, self.mutation_event.mutation_type, remote.version()).await
            }
            ConflictResolution::Retry(model) => self.send_retry(&model, MutationType::Update, remote.version()).await,
        }
    }

    fn apply_remote(&self, remote: &MutationSync) -> DataStoreResult<MutationEvent> {
        self.check_cancelled()?;
        self.storage.transaction(&mut |tx| {
            tx.save_model(&remote.model)?;
            tx.save_sync_metadata(&remote.sync_metadata)?;
            Ok(())
        })?;
        self.notify_applied(remote)
    }

    fn apply_remote_delete(&self, remote: &MutationSync) -> DataStoreResult<MutationEvent> {
        self.check_cancelled()?;
        self.storage.transaction(&mut |tx| {
            match tx.delete_model(&remote.model.model_name, &remote.model.id) {
                Err(e) if tx.should_ignore_error(&e) => {}
                result => result?,
            }
            tx.save_sync_metadata(&remote.sync_metadata)?;
            Ok(())
        })?;
        self.notify_applied(remote)
    }

    fn notify_applied(&self, remote: &MutationSync) -> DataStoreResult<MutationEvent> {
        let mutation_type = if remote.is_deleted() {
            MutationType::Delete
        } else if remote.version() == 1 {
            MutationType::Create
        } else {
            MutationType::Update
        };

        let event = MutationEvent::new(&remote.model, mutation_type, Some(remote.version()))?;
        self.events.dispatch(DataStoreEvent::SyncReceived(event.clone()));
        Ok(event)
    }

    async fn send_retry(
        &self,
        model: &AnyModel,
        mutation_type: MutationType,
        version: i64,
    ) -> DataStoreResult<Option<MutationEvent>> {
        let event = MutationEvent::new(model, mutation_type, Some(version))?;
        let sender = SyncMutationToCloudOperation::new(
            event,
            self.transport.clone(),
            self.configuration.auth_types_for(&model.model_name),
            self.retry_policy.clone(),
        )
        .with_cancellation(self.cancel.child_token());

        match sender.run().await {
            Ok(Ok(acknowledged)) => {
                self.storage
                    .transaction(&mut |tx| record_acknowledgement(tx, &acknowledged))?;
                Ok(None)
            }
            Ok(Err(response_error)) => {
                self.configuration
                    .handle_error(DataStoreError::GraphQL(response_error.to_string()));
                Ok(None)
            }
            Err(DataStoreError::Cancelled) => Err(DataStoreError::Cancelled),
            Err(e) => {
                self.configuration.handle_error(e);
                Ok(None)
            }
        }
    }

    fn check_cancelled(&self) -> DataStoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DataStoreError::Cancelled);
        }
        Ok(())
    }
}

fn resolution_name(resolution: &ConflictResolution) -> &'static str {
    match resolution {
        ConflictResolution::ApplyRemote => "applyRemote",
        ConflictResolution::RetryLocal => "retryLocal",
        ConflictResolution::Retry(_) => "retry",
    }
}

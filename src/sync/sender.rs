//! Mutation-to-cloud sender
//!
//! Sends one mutation event through the GraphQL transport. Failed calls are
//! retried with the advice of the retry policy, except authorization
//! failures, which move on to the next auth type straight away. A scheduled
//! retry fires when its timer elapses or when the endpoint comes back
//! online, whichever happens first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::api::{ApiError, AuthType, GraphQLTransport, ReachabilityUpdate};
use super::error::{DataStoreError, DataStoreResult};
use super::graphql::{GraphQLRequest, GraphQLResponse};
use super::models::MutationEvent;
use super::retry::{RequestRetryAdvice, RequestRetryablePolicy, RetryTrigger};

/// Ordered auth types still to try
#[derive(Debug, Clone, Default)]
pub struct AuthTypeIterator {
    remaining: VecDeque<AuthType>,
}

impl AuthTypeIterator {
    pub fn new(auth_types: Vec<AuthType>) -> Self {
        Self {
            remaining: auth_types.into(),
        }
    }

    pub fn has_next(&self) -> bool {
        !self.remaining.is_empty()
    }
}

impl Iterator for AuthTypeIterator {
    type Item = AuthType;

    fn next(&mut self) -> Option<AuthType> {
        self.remaining.pop_front()
    }
}

pub struct SyncMutationToCloudOperation {
    mutation_event: MutationEvent,
    transport: Arc<dyn GraphQLTransport>,
    auth_types: Vec<AuthType>,
    retry_policy: Arc<dyn RequestRetryablePolicy>,
    cancel: CancellationToken,
    attempt_number: AtomicU32,
    reachability: OnceLock<Option<watch::Receiver<ReachabilityUpdate>>>,
}

impl SyncMutationToCloudOperation {
    pub fn new(
        mutation_event: MutationEvent,
        transport: Arc<dyn GraphQLTransport>,
        auth_types: Vec<AuthType>,
        retry_policy: Arc<dyn RequestRetryablePolicy>,
    ) -> Self {
        Self {
            mutation_event,
            transport,
            auth_types,
            retry_policy,
            cancel: CancellationToken::new(),
            attempt_number: AtomicU32::new(1),
            reachability: OnceLock::new(),
        }
    }

    /// Tie the operation to an outer cancellation scope.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn mutation_event(&self) -> &MutationEvent {
        &self.mutation_event
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn attempt_number(&self) -> u32 {
        self.attempt_number.load(Ordering::SeqCst)
    }

    /// Send the mutation until it succeeds, reaches the service with a
    /// GraphQL error, runs out of retries, or is cancelled.
    pub async fn run(&self) -> DataStoreResult<GraphQLResponse> {
        let request = GraphQLRequest::from_mutation_event(&self.mutation_event)?;
        let mut auth_types = AuthTypeIterator::new(self.auth_types.clone());
        let mut auth_type = auth_types.next();

        loop {
            if self.cancel.is_cancelled() {
                return Err(DataStoreError::Cancelled);
            }

            log::debug!(
                "Sending {} {} {} (attempt {}, auth {:?})",
                self.mutation_event.mutation_type.as_str(),
                self.mutation_event.model_name,
                self.mutation_event.model_id,
                self.attempt_number(),
                auth_type
            );

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DataStoreError::Cancelled),
                result = self.transport.mutate(request.clone().with_auth_type(auth_type)) => result,
            };

            let error = match result {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let advice = self.retry_advice(&error, &mut auth_types, &mut auth_type);
            if !advice.should_retry {
                log::warn!(
                    "Giving up on {} {} after {} attempt(s): {}",
                    self.mutation_event.model_name,
                    self.mutation_event.model_id,
                    self.attempt_number(),
                    error
                );
                return Err(DataStoreError::Api(error));
            }

            self.wait_for_retry(advice.retry_interval).await?;
            self.attempt_number.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn retry_advice(
        &self,
        error: &ApiError,
        auth_types: &mut AuthTypeIterator,
        auth_type: &mut Option<AuthType>,
    ) -> RequestRetryAdvice {
        if error.is_auth_error() {
            return match auth_types.next() {
                Some(next) => {
                    log::info!("Auth type {:?} rejected, retrying with {:?}", auth_type, next);
                    *auth_type = Some(next);
                    RequestRetryAdvice::immediately()
                }
                None => RequestRetryAdvice::no_retry(Duration::ZERO),
            };
        }

        let attempt = self.attempt_number();
        match error {
            ApiError::Network { code, .. } => self
                .retry_policy
                .retry_request_advice(&RetryTrigger::Network(*code), attempt),
            ApiError::HttpStatus { status, retry_after, .. } => self.retry_policy.retry_request_advice(
                &RetryTrigger::HttpStatus {
                    status: *status,
                    retry_after: *retry_after,
                },
                attempt,
            ),
            _ => RequestRetryAdvice::no_retry(Duration::ZERO),
        }
    }

    /// Sleep for `interval` or until connectivity returns.
    async fn wait_for_retry(&self, interval: Duration) -> DataStoreResult<()> {
        if interval.is_zero() {
            return Ok(());
        }

        log::debug!(
            "Retrying {} {} in {:?}",
            self.mutation_event.model_name,
            self.mutation_event.model_id,
            interval
        );

        let reachability = self
            .reachability
            .get_or_init(|| self.transport.reachability())
            .clone();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DataStoreError::Cancelled),
            _ = tokio::time::sleep(interval) => Ok(()),
            _ = back_online(reachability) => {
                log::debug!("Network is back, retrying immediately");
                Ok(())
            }
        }
    }
}

/// Resolves on an offline to online transition; never resolves without a
/// reachability channel.
async fn back_online(reachability: Option<watch::Receiver<ReachabilityUpdate>>) {
    let Some(mut reachability) = reachability else {
        return std::future::pending().await;
    };

    let mut was_online = reachability.borrow_and_update().is_online;
    loop {
        if reachability.changed().await.is_err() {
            return std::future::pending().await;
        }
        let is_online = reachability.borrow_and_update().is_online;
        if is_online && !was_online {
            return;
        }
        was_online = is_online;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::api::NetworkErrorCode;
    use crate::sync::models::{AnyModel, MutationType};
    use crate::sync::test_support::{accept_request, MockTransport, ScriptedRetryPolicy};
    use serde_json::json;

    fn update_event() -> MutationEvent {
        let model = AnyModel::new("Post", "p1", json!({"id": "p1", "title": "Local"}));
        MutationEvent::new(&model, MutationType::Update, Some(1)).unwrap()
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let transport = Arc::new(MockTransport::new(accept_request));
        let operation = SyncMutationToCloudOperation::new(
            update_event(),
            transport.clone(),
            vec![],
            Arc::new(ScriptedRetryPolicy::never()),
        );

        let response = operation.run().await.unwrap().unwrap();
        assert_eq!(response.sync_metadata.version, 2);
        assert_eq!(transport.request_count(), 1);
        assert_eq!(operation.attempt_number(), 1);
    }

    #[tokio::test]
    async fn test_server_errors_retry_until_policy_gives_up() {
        let transport = Arc::new(MockTransport::new(|_| Err(ApiError::status(500))));
        let policy = Arc::new(ScriptedRetryPolicy::new(vec![
            RequestRetryAdvice::retry_after(Duration::from_millis(5)),
            RequestRetryAdvice::retry_after(Duration::from_millis(5)),
            RequestRetryAdvice::no_retry(Duration::from_secs(60)),
        ]));
        let operation = SyncMutationToCloudOperation::new(update_event(), transport.clone(), vec![], policy.clone());

        let err = operation.run().await.unwrap_err();

        assert!(matches!(err, DataStoreError::Api(ApiError::HttpStatus { status: 500, .. })));
        assert_eq!(transport.request_count(), 3);
        assert_eq!(policy.attempts_seen(), vec![1, 2, 3]);
        assert_eq!(operation.attempt_number(), 3);
    }

    #[tokio::test]
    async fn test_unauthorized_falls_back_to_next_auth_type() {
        let transport = Arc::new(MockTransport::new(|request| match request.auth_type {
            Some(AuthType::AmazonCognitoUserPools) => Err(ApiError::status(401)),
            _ => accept_request(request),
        }));
        let operation = SyncMutationToCloudOperation::new(
            update_event(),
            transport.clone(),
            vec![AuthType::AmazonCognitoUserPools, AuthType::ApiKey],
            Arc::new(ScriptedRetryPolicy::never()),
        );

        assert!(operation.run().await.unwrap().is_ok());

        let auth_types: Vec<_> = transport.requests().iter().map(|r| r.auth_type).collect();
        assert_eq!(auth_types, vec![Some(AuthType::AmazonCognitoUserPools), Some(AuthType::ApiKey)]);
    }

    #[tokio::test]
    async fn test_signed_out_falls_back_then_surfaces() {
        let transport = Arc::new(MockTransport::new(|_| Err(ApiError::SignedOut)));
        let operation = SyncMutationToCloudOperation::new(
            update_event(),
            transport.clone(),
            vec![AuthType::AmazonCognitoUserPools, AuthType::OpenidConnect],
            Arc::new(ScriptedRetryPolicy::always(Duration::from_millis(1))),
        );

        let err = operation.run().await.unwrap_err();

        assert!(matches!(err, DataStoreError::Api(ApiError::SignedOut)));
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_without_fallback_is_final() {
        let transport = Arc::new(MockTransport::new(|_| Err(ApiError::Unauthorized("no token".to_string()))));
        let policy = Arc::new(ScriptedRetryPolicy::always(Duration::from_millis(1)));
        let operation = SyncMutationToCloudOperation::new(
            update_event(),
            transport.clone(),
            vec![AuthType::AmazonCognitoUserPools],
            policy.clone(),
        );

        assert!(operation.run().await.is_err());
        assert_eq!(transport.request_count(), 1);
        assert!(policy.attempts_seen().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_preempts_retry_timer() {
        let (online_tx, online_rx) = watch::channel(ReachabilityUpdate { is_online: false });
        let transport = Arc::new(
            MockTransport::new(accept_request)
                .with_script(vec![Err(ApiError::network(NetworkErrorCode::NotConnectedToInternet, "offline"))])
                .with_reachability(online_rx),
        );
        let operation = Arc::new(SyncMutationToCloudOperation::new(
            update_event(),
            transport.clone(),
            vec![],
            Arc::new(ScriptedRetryPolicy::always(Duration::from_secs(86_400))),
        ));

        let running = {
            let operation = operation.clone();
            tokio::spawn(async move { operation.run().await })
        };

        transport.wait_for_requests(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        online_tx.send_replace(ReachabilityUpdate { is_online: true });

        let response = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("retry did not fire on reconnect")
            .unwrap();
        assert!(response.unwrap().is_ok());
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let transport = Arc::new(MockTransport::new(|_| Err(ApiError::status(503))));
        let operation = Arc::new(SyncMutationToCloudOperation::new(
            update_event(),
            transport.clone(),
            vec![],
            Arc::new(ScriptedRetryPolicy::always(Duration::from_secs(86_400))),
        ));

        let running = {
            let operation = operation.clone();
            tokio::spawn(async move { operation.run().await })
        };

        transport.wait_for_requests(1).await;
        operation.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
        assert!(matches!(result, Err(DataStoreError::Cancelled)));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_sends_nothing() {
        let transport = Arc::new(MockTransport::new(accept_request));
        let operation = SyncMutationToCloudOperation::new(
            update_event(),
            transport.clone(),
            vec![],
            Arc::new(ScriptedRetryPolicy::never()),
        );

        operation.cancel();
        assert!(matches!(operation.run().await, Err(DataStoreError::Cancelled)));
        assert_eq!(transport.request_count(), 0);
    }
}

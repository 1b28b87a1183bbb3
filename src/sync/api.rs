//! GraphQL transport - HTTP communication with the AppSync endpoint
//!
//! - `GraphQLTransport`: the seam the sync engine sends mutations through
//! - `ApiError` / `NetworkErrorCode`: transport failure classification
//! - `AppSyncClient`: reqwest implementation with API-key and token auth
//! - `ModelRegistry`: model name to selection-set lookup used when rendering
//!   documents

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use url::Url;

use super::graphql::{GraphQLError, GraphQLRequest, GraphQLResponse, GraphQLResponseError};
use super::models::MutationSync;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const API_KEY_HEADER: &str = "x-api-key";

/// Authorization mode used for a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
    ApiKey,
    AmazonCognitoUserPools,
    AwsIam,
    OpenidConnect,
    AwsLambda,
}

impl AuthType {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_uppercase().as_str() {
            "API_KEY" => Ok(AuthType::ApiKey),
            "AMAZON_COGNITO_USER_POOLS" => Ok(AuthType::AmazonCognitoUserPools),
            "AWS_IAM" => Ok(AuthType::AwsIam),
            "OPENID_CONNECT" => Ok(AuthType::OpenidConnect),
            "AWS_LAMBDA" => Ok(AuthType::AwsLambda),
            other => Err(format!("Invalid auth type: {}", other)),
        }
    }
}

/// Transport-level error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorCode {
    NotConnectedToInternet,
    DnsLookupFailed,
    CannotConnectToHost,
    CannotFindHost,
    TimedOut,
    CannotParseResponse,
    NetworkConnectionLost,
    TooManyRedirects,
    Other,
}

impl NetworkErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetworkErrorCode::NotConnectedToInternet
                | NetworkErrorCode::DnsLookupFailed
                | NetworkErrorCode::CannotConnectToHost
                | NetworkErrorCode::CannotFindHost
                | NetworkErrorCode::TimedOut
                | NetworkErrorCode::CannotParseResponse
                | NetworkErrorCode::NetworkConnectionLost
        )
    }
}

/// GraphQL transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("Network error ({code:?}): {message}")]
    Network { code: NetworkErrorCode, message: String },

    #[error("HTTP {status}: {body}")]
    HttpStatus {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Signed out - sign in required")]
    SignedOut,

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl ApiError {
    pub fn network(code: NetworkErrorCode, message: impl Into<String>) -> Self {
        ApiError::Network {
            code,
            message: message.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        ApiError::HttpStatus {
            status,
            retry_after: None,
            body: String::new(),
        }
    }

    /// 401 responses and locally raised authorization failures, including
    /// a missing sign-in
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            ApiError::HttpStatus { status: 401, .. } | ApiError::Unauthorized(_) | ApiError::SignedOut
        )
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        let code = if e.is_timeout() {
            NetworkErrorCode::TimedOut
        } else if e.is_redirect() {
            NetworkErrorCode::TooManyRedirects
        } else if e.is_connect() {
            NetworkErrorCode::CannotConnectToHost
        } else if e.is_decode() || e.is_body() {
            NetworkErrorCode::CannotParseResponse
        } else if e.is_request() {
            NetworkErrorCode::NetworkConnectionLost
        } else {
            NetworkErrorCode::Other
        };
        ApiError::network(code, e.to_string())
    }
}

/// Connectivity as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachabilityUpdate {
    pub is_online: bool,
}

#[async_trait]
pub trait GraphQLTransport: Send + Sync {
    /// Send one mutation. Dropping the future cancels the call.
    async fn mutate(&self, request: GraphQLRequest) -> Result<GraphQLResponse, ApiError>;

    /// Connectivity changes for the endpoint, when the transport tracks them
    fn reachability(&self) -> Option<watch::Receiver<ReachabilityUpdate>> {
        None
    }
}

/// Field list for one model type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    pub fields: Vec<String>,
}

impl ModelSchema {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    schemas: HashMap<String, ModelSchema>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, schema: ModelSchema) -> Self {
        self.schemas.insert(schema.name.clone(), schema);
        self
    }

    pub fn get(&self, model_name: &str) -> Option<&ModelSchema> {
        self.schemas.get(model_name)
    }

    /// Unknown models select only the identity and sync fields
    pub fn fields(&self, model_name: &str) -> &[String] {
        self.schemas.get(model_name).map(|s| s.fields.as_slice()).unwrap_or(&[])
    }
}

/// AppSync client over HTTP
pub struct AppSyncClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    /// Access token for user-pool, OIDC and Lambda auth (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
    registry: ModelRegistry,
    reachability: watch::Sender<ReachabilityUpdate>,
}

impl AppSyncClient {
    pub fn new(endpoint: &str, registry: ModelRegistry) -> Result<Self, ApiError> {
        Self::with_timeout(endpoint, registry, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(endpoint: &str, registry: ModelRegistry, timeout: Duration) -> Result<Self, ApiError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ApiError::Operation(format!("Invalid endpoint {}: {}", endpoint, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Operation(format!("Failed to create HTTP client: {}", e)))?;
        let (reachability, _) = watch::channel(ReachabilityUpdate { is_online: true });

        Ok(Self {
            client,
            endpoint,
            api_key: None,
            access_token: Arc::new(RwLock::new(None)),
            registry,
            reachability,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set access token (after sign-in)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Get current token
    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (sign-out)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    /// Publish a connectivity change, e.g. from a platform network monitor
    pub fn set_online(&self, is_online: bool) {
        let changed = self.reachability.send_if_modified(|current| {
            if current.is_online == is_online {
                return false;
            }
            current.is_online = is_online;
            true
        });
        if changed {
            log::info!("AppSync endpoint is now {}", if is_online { "reachable" } else { "unreachable" });
        }
    }

    async fn authorize(&self, builder: RequestBuilder, auth_type: Option<AuthType>) -> Result<RequestBuilder, ApiError> {
        match auth_type {
            Some(AuthType::ApiKey) => {
                let key = self
                    .api_key
                    .as_ref()
                    .ok_or_else(|| ApiError::Unauthorized("No API key configured".to_string()))?;
                Ok(builder.header(API_KEY_HEADER, key))
            }
            Some(AuthType::AmazonCognitoUserPools | AuthType::OpenidConnect | AuthType::AwsLambda) => {
                let token = self.get_token().await.ok_or(ApiError::SignedOut)?;
                Ok(builder.header(AUTHORIZATION, token))
            }
            Some(AuthType::AwsIam) => Err(ApiError::Unauthorized(
                "IAM request signing is not configured".to_string(),
            )),
            None => {
                if let Some(token) = self.get_token().await {
                    Ok(builder.header(AUTHORIZATION, token))
                } else if let Some(key) = &self.api_key {
                    Ok(builder.header(API_KEY_HEADER, key))
                } else {
                    Ok(builder)
                }
            }
        }
    }
}

#[async_trait]
impl GraphQLTransport for AppSyncClient {
    async fn mutate(&self, request: GraphQLRequest) -> Result<GraphQLResponse, ApiError> {
        let body = json!({
            "query": request.document(self.registry.fields(&request.model_name)),
            "variables": request.variables(),
        });

        let builder = self.client.post(self.endpoint.clone()).json(&body);
        let builder = self.authorize(builder, request.auth_type).await?;

        log::debug!(
            "Sending {} for {} {:?}",
            request.field_name(),
            request.model_name,
            request.model_id()
        );

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = ApiError::from(e);
                if let ApiError::Network { code, .. } = &error {
                    if code.is_retryable() {
                        self.set_online(false);
                    }
                }
                return Err(error);
            }
        };

        self.set_online(true);
        handle_response(response, &request).await
    }

    fn reachability(&self) -> Option<watch::Receiver<ReachabilityUpdate>> {
        Some(self.reachability.subscribe())
    }
}

#[derive(Debug, Deserialize)]
struct GraphQLPayload {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GraphQLError>>,
}

/// Decode a response body into a mutation result
async fn handle_response(response: reqwest::Response, request: &GraphQLRequest) -> Result<GraphQLResponse, ApiError> {
    if !response.status().is_success() {
        return Err(handle_error(response).await);
    }

    let raw = response.text().await?;
    let payload: GraphQLPayload = serde_json::from_str(&raw)
        .map_err(|e| ApiError::InvalidResponse(format!("Response is not a GraphQL payload: {}", e)))?;

    let field = request.field_name();
    let data = payload
        .data
        .as_ref()
        .and_then(|d| d.get(&field))
        .filter(|v| !v.is_null());
    let errors = payload.errors.filter(|errors| !errors.is_empty());

    let result = match (data, errors) {
        (None, Some(errors)) => Err(GraphQLResponseError::Error(errors)),
        (Some(data), Some(errors)) => Err(GraphQLResponseError::PartialResult {
            partial: data.clone(),
            errors,
        }),
        (Some(data), None) => MutationSync::from_graphql_value(data, &request.model_name).map_err(|e| {
            GraphQLResponseError::TransformationError {
                raw,
                message: e.to_string(),
            }
        }),
        (None, None) => Err(GraphQLResponseError::TransformationError {
            raw,
            message: format!("Response is missing `{}`", field),
        }),
    };

    Ok(result)
}

/// Convert a non-2xx response to ApiError
async fn handle_error(response: reqwest::Response) -> ApiError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());

    ApiError::HttpStatus {
        status: status.as_u16(),
        retry_after,
        body,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::graphql::AppSyncErrorType;
    use crate::sync::models::{AnyModel, MutationType};

    fn registry() -> ModelRegistry {
        ModelRegistry::new().register(ModelSchema::new("Post", &["id", "title"]))
    }

    fn update_request(auth_type: Option<AuthType>) -> GraphQLRequest {
        let model = AnyModel::new("Post", "p1", json!({"id": "p1", "title": "Local"}));
        GraphQLRequest::mutation(&model, MutationType::Update, Some(1), None).with_auth_type(auth_type)
    }

    #[tokio::test]
    async fn test_token_management() {
        let client = AppSyncClient::new("https://example.com/graphql", registry()).unwrap();
        assert!(client.get_token().await.is_none());

        client.set_token("token".to_string()).await;
        assert_eq!(client.get_token().await, Some("token".to_string()));

        client.clear_token().await;
        assert!(client.get_token().await.is_none());
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(matches!(
            AppSyncClient::new("not a url", registry()),
            Err(ApiError::Operation(_))
        ));
    }

    #[tokio::test]
    async fn test_mutate_success_with_api_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/graphql")
            .match_header("x-api-key", "secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"data": {"updatePost": {
                    "id": "p1", "title": "Local", "__typename": "Post",
                    "_version": 2, "_deleted": false, "_lastChangedAt": 1000
                }}})
                .to_string(),
            )
            .create_async()
            .await;

        let client = AppSyncClient::new(&format!("{}/graphql", server.url()), registry())
            .unwrap()
            .with_api_key("secret");
        let result = client.mutate(update_request(Some(AuthType::ApiKey))).await.unwrap();

        let sync = result.unwrap();
        assert_eq!(sync.sync_metadata.version, 2);
        assert_eq!(sync.model.instance["title"], "Local");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_mutate_returns_graphql_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/graphql")
            .with_status(200)
            .with_body(
                json!({"data": {"updatePost": null}, "errors": [{
                    "path": ["updatePost"],
                    "data": {"id": "p1", "title": "Remote", "_version": 2},
                    "errorType": "ConflictUnhandled",
                    "errorInfo": null,
                    "locations": [{"line": 2, "column": 3}],
                    "message": "Conflict resolver rejects mutation."
                }]})
                .to_string(),
            )
            .create_async()
            .await;

        let client = AppSyncClient::new(&format!("{}/graphql", server.url()), registry()).unwrap();
        let result = client.mutate(update_request(None)).await.unwrap();

        match result {
            Err(GraphQLResponseError::Error(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].error_type(), Some(AppSyncErrorType::ConflictUnhandled));
                let extensions = errors[0].extensions.as_ref().unwrap();
                assert_eq!(extensions["data"]["_version"], 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_throttled_response_carries_retry_after() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/graphql")
            .with_status(429)
            .with_header("retry-after", "42")
            .with_body("slow down")
            .create_async()
            .await;

        let client = AppSyncClient::new(&format!("{}/graphql", server.url()), registry()).unwrap();
        let err = client.mutate(update_request(None)).await.unwrap_err();

        match err {
            ApiError::HttpStatus { status, retry_after, .. } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after, Some(Duration::from_secs(42)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_are_auth_errors() {
        let client = AppSyncClient::new("https://example.com/graphql", registry()).unwrap();

        let err = client
            .mutate(update_request(Some(AuthType::AmazonCognitoUserPools)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SignedOut));
        assert!(err.is_auth_error());

        let err = client.mutate(update_request(Some(AuthType::AwsIam))).await.unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_connection_failure_marks_endpoint_unreachable() {
        let client = AppSyncClient::with_timeout(
            "http://127.0.0.1:1/graphql",
            registry(),
            Duration::from_secs(5),
        )
        .unwrap();
        let reachability = client.reachability().unwrap();
        assert!(reachability.borrow().is_online);

        let err = client.mutate(update_request(None)).await.unwrap_err();
        assert!(matches!(err, ApiError::Network { .. }));
        assert!(!reachability.borrow().is_online);
    }

    #[tokio::test]
    async fn test_non_graphql_body_is_invalid_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/graphql")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>captive portal</html>")
            .create_async()
            .await;

        let client = AppSyncClient::new(&format!("{}/graphql", server.url()), registry()).unwrap();
        let err = client.mutate(update_request(None)).await.unwrap_err();

        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[test]
    fn test_auth_type_parsing() {
        assert_eq!(AuthType::from_str("api_key").unwrap(), AuthType::ApiKey);
        assert_eq!(AuthType::from_str(" AWS_IAM ").unwrap(), AuthType::AwsIam);
        assert!(AuthType::from_str("basic").is_err());
    }
}

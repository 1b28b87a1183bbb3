//! Sync configuration
//!
//! - `SyncSettings`: serializable settings, persisted in the settings table
//!   and overridable from the environment
//! - `DataStoreConfiguration`: runtime configuration with the caller's
//!   conflict handler, error handler, sync expressions and auth types

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::{Database, DbResult};

use super::api::AuthType;
use super::error::{DataStoreError, DataStoreResult};
use super::models::{AnyModel, ConflictData, ConflictResolution};
use super::retry::RetryConfig;

/// Settings table key
pub const SETTINGS_KEY: &str = "datastore_sync_settings";

const ENV_ENDPOINT: &str = "DATASTORE_SYNC_ENDPOINT";
const ENV_RETRY_BASE_MS: &str = "DATASTORE_SYNC_RETRY_BASE_MS";
const ENV_RETRY_MAX_WAIT_MS: &str = "DATASTORE_SYNC_RETRY_MAX_WAIT_MS";
const ENV_AUTH_TYPES: &str = "DATASTORE_SYNC_AUTH_TYPES";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// GraphQL endpoint URL
    pub endpoint: Option<String>,
    /// Auth types tried in order for models without their own list
    pub default_auth_types: Vec<AuthType>,
    pub retry: RetryConfig,
    /// Capacity of the broadcast channels for hub and queue events
    pub event_buffer_size: usize,
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            default_auth_types: Vec::new(),
            retry: RetryConfig::default(),
            event_buffer_size: 256,
            request_timeout_secs: 30,
        }
    }
}

impl SyncSettings {
    /// Defaults overridden by `.env` and process environment variables
    pub fn from_env() -> DataStoreResult<Self> {
        dotenvy::dotenv().ok();
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> DataStoreResult<Self> {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = Some(endpoint);
        }
        if let Some(value) = lookup(ENV_RETRY_BASE_MS) {
            self.retry.base_delay_ms = parse_number(ENV_RETRY_BASE_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_RETRY_MAX_WAIT_MS) {
            self.retry.max_wait_ms = parse_number(ENV_RETRY_MAX_WAIT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_AUTH_TYPES) {
            self.default_auth_types = value
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(AuthType::from_str)
                .collect::<Result<Vec<_>, _>>()
                .map_err(DataStoreError::Configuration)?;
        }
        Ok(self)
    }

    /// Load from the settings table, falling back to defaults
    pub fn load(db: &Database) -> DbResult<Self> {
        Ok(db.get_setting(SETTINGS_KEY)?.unwrap_or_default())
    }

    pub fn save(&self, db: &Database) -> DbResult<()> {
        db.set_setting(SETTINGS_KEY, self)
    }

    pub fn validate(&self) -> DataStoreResult<()> {
        if self.event_buffer_size == 0 {
            return Err(DataStoreError::Configuration("event_buffer_size must be at least 1".to_string()));
        }
        if let Some(endpoint) = &self.endpoint {
            let url = url::Url::parse(endpoint)
                .map_err(|e| DataStoreError::Configuration(format!("Invalid endpoint {}: {}", endpoint, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(DataStoreError::Configuration(format!(
                    "Endpoint must be http(s), got {}",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> DataStoreResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| DataStoreError::Configuration(format!("{} must be a number, got {:?}", key, value)))
}

/// Decides the outcome of a version conflict
#[async_trait]
pub trait ConflictHandler: Send + Sync {
    async fn resolve(&self, conflict: ConflictData) -> ConflictResolution;
}

#[async_trait]
impl<F> ConflictHandler for F
where
    F: Fn(ConflictData) -> ConflictResolution + Send + Sync,
{
    async fn resolve(&self, conflict: ConflictData) -> ConflictResolution {
        self(conflict)
    }
}

pub type ErrorHandler = Arc<dyn Fn(DataStoreError) + Send + Sync>;

/// Per-model filter applied to incoming remote models
#[derive(Clone)]
pub struct SyncExpression {
    model_name: String,
    predicate: Arc<dyn Fn(&AnyModel) -> bool + Send + Sync>,
}

impl SyncExpression {
    pub fn new(model_name: impl Into<String>, predicate: impl Fn(&AnyModel) -> bool + Send + Sync + 'static) -> Self {
        Self {
            model_name: model_name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn matches(&self, model: &AnyModel) -> bool {
        (self.predicate)(model)
    }
}

impl fmt::Debug for SyncExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncExpression").field("model_name", &self.model_name).finish()
    }
}

#[derive(Clone)]
pub struct DataStoreConfiguration {
    pub conflict_handler: Arc<dyn ConflictHandler>,
    pub error_handler: ErrorHandler,
    pub sync_expressions: HashMap<String, SyncExpression>,
    pub auth_types: HashMap<String, Vec<AuthType>>,
    pub settings: SyncSettings,
}

impl Default for DataStoreConfiguration {
    fn default() -> Self {
        Self::new(SyncSettings::default())
    }
}

impl DataStoreConfiguration {
    /// Remote wins on conflict; async errors are logged.
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            conflict_handler: Arc::new(|_: ConflictData| ConflictResolution::ApplyRemote),
            error_handler: Arc::new(|error: DataStoreError| {
                log::error!("DataStore sync error: {}", error);
            }),
            sync_expressions: HashMap::new(),
            auth_types: HashMap::new(),
            settings,
        }
    }

    pub fn with_conflict_handler(mut self, handler: impl ConflictHandler + 'static) -> Self {
        self.conflict_handler = Arc::new(handler);
        self
    }

    pub fn with_error_handler(mut self, handler: impl Fn(DataStoreError) + Send + Sync + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    pub fn with_sync_expression(mut self, expression: SyncExpression) -> Self {
        self.sync_expressions.insert(expression.model_name.clone(), expression);
        self
    }

    pub fn with_auth_types(mut self, model_name: impl Into<String>, auth_types: Vec<AuthType>) -> Self {
        self.auth_types.insert(model_name.into(), auth_types);
        self
    }

    pub fn auth_types_for(&self, model_name: &str) -> Vec<AuthType> {
        self.auth_types
            .get(model_name)
            .cloned()
            .unwrap_or_else(|| self.settings.default_auth_types.clone())
    }

    pub fn sync_expression(&self, model_name: &str) -> Option<&SyncExpression> {
        self.sync_expressions.get(model_name)
    }

    pub fn handle_error(&self, error: DataStoreError) {
        (self.error_handler)(error)
    }
}

impl fmt::Debug for DataStoreConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStoreConfiguration")
            .field("sync_expressions", &self.sync_expressions.keys().collect::<Vec<_>>())
            .field("auth_types", &self.auth_types)
            .field("settings", &self.settings)
            .finish()
    }
}

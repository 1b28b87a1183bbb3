//! Local storage adapter contract
//!
//! The engine never talks to SQLite directly. Everything it needs from the
//! local store goes through `StorageAdapter`, which `crate::db::Database`
//! implements for pooled connections and for open transactions.

use std::sync::Arc;

use crate::db::{DbError, DbResult};

use super::error::DataStoreResult;
use super::models::{AnyModel, MutationEvent, MutationSyncMetadata};

/// Predicate for querying the durable mutation log. Results are always
/// ordered oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationEventFilter {
    pub model_name: Option<String>,
    pub model_ids: Option<Vec<String>>,
    pub in_process: Option<bool>,
}

impl MutationEventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Events not yet picked up by the outgoing queue
    pub fn pending() -> Self {
        Self {
            in_process: Some(false),
            ..Self::default()
        }
    }

    pub fn pending_for(model_name: &str, model_ids: &[String]) -> Self {
        Self {
            model_name: Some(model_name.to_string()),
            model_ids: Some(model_ids.to_vec()),
            in_process: Some(false),
        }
    }

    /// Every event for the given model instances, in process or not
    pub fn for_models(model_name: &str, model_ids: &[String]) -> Self {
        Self {
            model_name: Some(model_name.to_string()),
            model_ids: Some(model_ids.to_vec()),
            in_process: None,
        }
    }
}

pub type TransactionBody<'a> = dyn FnMut(&dyn StorageAdapter) -> DataStoreResult<()> + 'a;

pub trait StorageAdapter {
    fn save_model(&self, model: &AnyModel) -> DbResult<AnyModel>;

    /// Fails with `DbError::NotFound` when the model is absent.
    fn delete_model(&self, model_name: &str, id: &str) -> DbResult<()>;

    fn query_model(&self, model_name: &str, id: &str) -> DbResult<Option<AnyModel>>;

    fn query_models(&self, model_name: &str) -> DbResult<Vec<AnyModel>>;

    fn save_mutation_event(&self, event: &MutationEvent) -> DbResult<MutationEvent>;

    fn delete_mutation_event(&self, id: &str) -> DbResult<()>;

    fn query_mutation_events(&self, filter: &MutationEventFilter) -> DbResult<Vec<MutationEvent>>;

    fn save_sync_metadata(&self, metadata: &MutationSyncMetadata) -> DbResult<MutationSyncMetadata>;

    fn query_sync_metadata(&self, model_name: &str, model_ids: &[String]) -> DbResult<Vec<MutationSyncMetadata>>;

    /// Run `body` all-or-nothing. Calls made through the adapter handed to
    /// `body` join the transaction.
    fn transaction(&self, body: &mut TransactionBody<'_>) -> DataStoreResult<()>;

    /// Benign conditions a caller may treat as a drop rather than a failure
    fn should_ignore_error(&self, error: &DbError) -> bool {
        matches!(error, DbError::NotFound(_))
    }
}

pub type SharedStorage = Arc<dyn StorageAdapter + Send + Sync>;

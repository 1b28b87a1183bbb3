//! Error taxonomy for the sync engine

use std::sync::Arc;

use thiserror::Error;

use crate::db::DbError;

use super::api::ApiError;

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("GraphQL error: {0}")]
    GraphQL(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}. This is a bug, please report it")]
    Internal(String),
}

impl From<serde_json::Error> for DataStoreError {
    fn from(e: serde_json::Error) -> Self {
        DataStoreError::Decoding(e.to_string())
    }
}

impl DataStoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DataStoreError::Cancelled)
    }
}

pub type DataStoreResult<T> = Result<T, DataStoreError>;

/// Error shared between state-machine states and broadcast subscribers
pub type SharedError = Arc<DataStoreError>;

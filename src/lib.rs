//! # DataStore Sync
//!
//! Offline-first sync engine: local writes are stored in SQLite and recorded
//! in a durable mutation log, delivered to a GraphQL backend one at a time,
//! and remote changes arriving on subscriptions are reconciled into the
//! local store.

pub mod db;
pub mod sync;

pub use db::{Database, DbError, DbResult};
pub use sync::{DataStoreConfiguration, DataStoreError, DataStoreResult, SyncEngine};

// ============================================================================
// Logging
// ============================================================================

/// Load `.env` and install the `env_logger` backend (`RUST_LOG`, default
/// `info`). Safe to call more than once.
pub fn init_logging() {
    dotenvy::dotenv().ok();

    if env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .is_err()
    {
        log::debug!("Logger already initialized");
    }
}

//! Database module for DataStore sync
//!
//! Provides the SQLite-backed local store used by the sync engine:
//! - model instances (JSON, keyed by model name and id)
//! - the durable outgoing mutation log
//! - per-instance sync metadata
//! - JSON settings

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::sync::error::DataStoreResult;
use crate::sync::models::{AnyModel, MutationEvent, MutationSyncMetadata, MutationType};
use crate::sync::storage::{MutationEventFilter, StorageAdapter, TransactionBody};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|conn| conn.busy_timeout(BUSY_TIMEOUT));

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        drop(conn);

        log::info!("Opened sync database at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled connection to `:memory:` is a separate database, so the
    /// pool holds exactly one connection and never recycles it.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Default on-disk location under the platform data directory
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "datastore", "datastore-sync")
            .map(|dirs| dirs.data_dir().join("datastore.db"))
    }

    /// Open the database at the default location, creating parent directories
    pub fn open_default() -> DbResult<Self> {
        let path = Self::default_path()
            .ok_or_else(|| DbError::NotFound("platform data directory".to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbError::Serialization(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        Self::new(path)
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;

        match json {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }
}

impl StorageAdapter for Database {
    fn save_model(&self, model: &AnyModel) -> DbResult<AnyModel> {
        save_model(&*self.get_conn()?, model)
    }

    fn delete_model(&self, model_name: &str, id: &str) -> DbResult<()> {
        delete_model(&*self.get_conn()?, model_name, id)
    }

    fn query_model(&self, model_name: &str, id: &str) -> DbResult<Option<AnyModel>> {
        query_model(&*self.get_conn()?, model_name, id)
    }

    fn query_models(&self, model_name: &str) -> DbResult<Vec<AnyModel>> {
        query_models(&*self.get_conn()?, model_name)
    }

    fn save_mutation_event(&self, event: &MutationEvent) -> DbResult<MutationEvent> {
        save_mutation_event(&*self.get_conn()?, event)
    }

    fn delete_mutation_event(&self, id: &str) -> DbResult<()> {
        delete_mutation_event(&*self.get_conn()?, id)
    }

    fn query_mutation_events(&self, filter: &MutationEventFilter) -> DbResult<Vec<MutationEvent>> {
        query_mutation_events(&*self.get_conn()?, filter)
    }

    fn save_sync_metadata(&self, metadata: &MutationSyncMetadata) -> DbResult<MutationSyncMetadata> {
        save_sync_metadata(&*self.get_conn()?, metadata)
    }

    fn query_sync_metadata(&self, model_name: &str, model_ids: &[String]) -> DbResult<Vec<MutationSyncMetadata>> {
        query_sync_metadata(&*self.get_conn()?, model_name, model_ids)
    }

    fn transaction(&self, body: &mut TransactionBody<'_>) -> DataStoreResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;

        let result = body(&TransactionAdapter { conn: &tx });
        match result {
            Ok(()) => {
                tx.commit().map_err(DbError::from)?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    log::warn!("Failed to roll back transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

/// Adapter bound to an open transaction
struct TransactionAdapter<'a> {
    conn: &'a Connection,
}

impl StorageAdapter for TransactionAdapter<'_> {
    fn save_model(&self, model: &AnyModel) -> DbResult<AnyModel> {
        save_model(self.conn, model)
    }

    fn delete_model(&self, model_name: &str, id: &str) -> DbResult<()> {
        delete_model(self.conn, model_name, id)
    }

    fn query_model(&self, model_name: &str, id: &str) -> DbResult<Option<AnyModel>> {
        query_model(self.conn, model_name, id)
    }

    fn query_models(&self, model_name: &str) -> DbResult<Vec<AnyModel>> {
        query_models(self.conn, model_name)
    }

    fn save_mutation_event(&self, event: &MutationEvent) -> DbResult<MutationEvent> {
        save_mutation_event(self.conn, event)
    }

    fn delete_mutation_event(&self, id: &str) -> DbResult<()> {
        delete_mutation_event(self.conn, id)
    }

    fn query_mutation_events(&self, filter: &MutationEventFilter) -> DbResult<Vec<MutationEvent>> {
        query_mutation_events(self.conn, filter)
    }

    fn save_sync_metadata(&self, metadata: &MutationSyncMetadata) -> DbResult<MutationSyncMetadata> {
        save_sync_metadata(self.conn, metadata)
    }

    fn query_sync_metadata(&self, model_name: &str, model_ids: &[String]) -> DbResult<Vec<MutationSyncMetadata>> {
        query_sync_metadata(self.conn, model_name, model_ids)
    }

    /// Already inside a transaction: run the body in place.
    fn transaction(&self, body: &mut TransactionBody<'_>) -> DataStoreResult<()> {
        body(self)
    }
}

// =========================================================================
// MODELS
// =========================================================================

fn save_model(conn: &Connection, model: &AnyModel) -> DbResult<AnyModel> {
    let data = serde_json::to_string(&model.instance)
        .map_err(|e| DbError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT INTO models (model_name, id, data, updated_at) VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(model_name, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        params![model.model_name, model.id, data],
    )
    .map_err(map_write_error)?;

    Ok(model.clone())
}

fn delete_model(conn: &Connection, model_name: &str, id: &str) -> DbResult<()> {
    let affected = conn.execute(
        "DELETE FROM models WHERE model_name = ?1 AND id = ?2",
        params![model_name, id],
    )?;

    if affected == 0 {
        return Err(DbError::NotFound(format!("{} {}", model_name, id)));
    }
    Ok(())
}

fn query_model(conn: &Connection, model_name: &str, id: &str) -> DbResult<Option<AnyModel>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM models WHERE model_name = ?1 AND id = ?2",
            params![model_name, id],
            |row| row.get(0),
        )
        .optional()?;

    data.map(|json| decode_model(model_name, id, &json)).transpose()
}

fn query_models(conn: &Connection, model_name: &str) -> DbResult<Vec<AnyModel>> {
    let mut stmt = conn.prepare("SELECT id, data FROM models WHERE model_name = ?1 ORDER BY id")?;
    let rows = stmt.query_map([model_name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

    let mut models = Vec::new();
    for row in rows {
        let (id, json) = row?;
        models.push(decode_model(model_name, &id, &json)?);
    }
    Ok(models)
}

fn decode_model(model_name: &str, id: &str, json: &str) -> DbResult<AnyModel> {
    let instance = serde_json::from_str(json)
        .map_err(|e| DbError::Serialization(format!("{} {}: {}", model_name, id, e)))?;
    Ok(AnyModel::new(model_name, id, instance))
}

// =========================================================================
// MUTATION EVENTS
// =========================================================================

const MUTATION_EVENT_COLUMNS: &str =
    "id, model_id, model_name, json, mutation_type, created_at, version, in_process, graphql_filter_json";

fn save_mutation_event(conn: &Connection, event: &MutationEvent) -> DbResult<MutationEvent> {
    conn.execute(
        "INSERT INTO mutation_events (id, model_id, model_name, json, mutation_type, created_at, version, in_process, graphql_filter_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            json = excluded.json,
            mutation_type = excluded.mutation_type,
            version = excluded.version,
            in_process = excluded.in_process,
            graphql_filter_json = excluded.graphql_filter_json",
        params![
            event.id,
            event.model_id,
            event.model_name,
            event.json,
            event.mutation_type.as_str(),
            event.created_at_key(),
            event.version,
            event.in_process,
            event.graphql_filter_json,
        ],
    )
    .map_err(map_write_error)?;

    Ok(event.clone())
}

fn delete_mutation_event(conn: &Connection, id: &str) -> DbResult<()> {
    let affected = conn.execute("DELETE FROM mutation_events WHERE id = ?1", [id])?;
    if affected == 0 {
        return Err(DbError::NotFound(format!("mutation event {}", id)));
    }
    Ok(())
}

fn query_mutation_events(conn: &Connection, filter: &MutationEventFilter) -> DbResult<Vec<MutationEvent>> {
    let mut sql = format!("SELECT {} FROM mutation_events WHERE 1 = 1", MUTATION_EVENT_COLUMNS);
    let mut values: Vec<String> = Vec::new();

    if let Some(model_name) = &filter.model_name {
        values.push(model_name.clone());
        sql.push_str(&format!(" AND model_name = ?{}", values.len()));
    }

    if let Some(model_ids) = &filter.model_ids {
        if model_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = model_ids
            .iter()
            .map(|id| {
                values.push(id.clone());
                format!("?{}", values.len())
            })
            .collect();
        sql.push_str(&format!(" AND model_id IN ({})", placeholders.join(", ")));
    }

    match filter.in_process {
        Some(true) => sql.push_str(" AND in_process = 1"),
        Some(false) => sql.push_str(" AND in_process = 0"),
        None => {}
    }

    sql.push_str(" ORDER BY created_at ASC, rowid ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), row_to_mutation_event)?;

    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
}

fn row_to_mutation_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<MutationEvent> {
    let mutation_type: String = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(MutationEvent {
        id: row.get(0)?,
        model_id: row.get(1)?,
        model_name: row.get(2)?,
        json: row.get(3)?,
        mutation_type: MutationType::from_str(&mutation_type).map_err(|e| conversion_error(4, e))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(5, e.to_string()))?,
        version: row.get(6)?,
        in_process: row.get(7)?,
        graphql_filter_json: row.get(8)?,
    })
}

// =========================================================================
// SYNC METADATA
// =========================================================================

fn save_sync_metadata(conn: &Connection, metadata: &MutationSyncMetadata) -> DbResult<MutationSyncMetadata> {
    conn.execute(
        "INSERT INTO mutation_sync_metadata (id, model_name, model_id, version, deleted, last_changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            version = excluded.version,
            deleted = excluded.deleted,
            last_changed_at = excluded.last_changed_at",
        params![
            metadata.identifier(),
            metadata.model_name,
            metadata.model_id,
            metadata.version,
            metadata.deleted,
            metadata.last_changed_at,
        ],
    )
    .map_err(map_write_error)?;

    Ok(metadata.clone())
}

fn query_sync_metadata(conn: &Connection, model_name: &str, model_ids: &[String]) -> DbResult<Vec<MutationSyncMetadata>> {
    if model_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<String> = (0..model_ids.len()).map(|i| format!("?{}", i + 2)).collect();
    let sql = format!(
        "SELECT model_id, model_name, version, deleted, last_changed_at FROM mutation_sync_metadata
         WHERE model_name = ?1 AND model_id IN ({})",
        placeholders.join(", ")
    );

    let mut values: Vec<&str> = Vec::with_capacity(model_ids.len() + 1);
    values.push(model_name);
    values.extend(model_ids.iter().map(String::as_str));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
        Ok(MutationSyncMetadata {
            model_id: row.get(0)?,
            model_name: row.get(1)?,
            version: row.get(2)?,
            deleted: row.get(3)?,
            last_changed_at: row.get(4)?,
        })
    })?;

    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
}

// =========================================================================
// HELPERS
// =========================================================================

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

fn map_write_error(e: rusqlite::Error) -> DbError {
    if let rusqlite::Error::SqliteFailure(err, message) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return DbError::Constraint(message.clone().unwrap_or_else(|| err.to_string()));
        }
    }
    DbError::Sqlite(e)
}

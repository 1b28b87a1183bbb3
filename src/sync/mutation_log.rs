//! Durable mutation log
//!
//! The outbox of local changes waiting to reach the cloud. Backed by the
//! `mutation_events` table through the storage adapter.
//!
//! Features:
//! - Coalescing of a new change with a pending change to the same model
//! - Oldest-first demand source for the outgoing queue
//! - Startup recovery of events left in-process by a previous run
//! - Outbox statistics

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;

use super::error::{DataStoreError, DataStoreResult};
use super::models::{MutationEvent, MutationType};
use super::storage::{MutationEventFilter, SharedStorage, StorageAdapter};

// ============================================================================
// Constants
// ============================================================================

const STORAGE_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub in_process: usize,
}

impl OutboxStats {
    pub fn is_empty(&self) -> bool {
        self.pending == 0 && self.in_process == 0
    }
}

/// Single-item demand source of mutation events
#[async_trait]
pub trait MutationEventSource: Send + Sync {
    /// The oldest pending event, already marked in-process. Waits while
    /// there is none; dropping the future abandons the request.
    async fn next_event(&self) -> DataStoreResult<MutationEvent>;
}

// ============================================================================
// Mutation Event Log
// ============================================================================

pub struct MutationEventLog {
    storage: SharedStorage,
    appended: Notify,
}

impl MutationEventLog {
    /// Open the log, returning events left in-process by a previous run to
    /// the pending set.
    pub fn new(storage: SharedStorage) -> DataStoreResult<Self> {
        let stale = storage.query_mutation_events(&MutationEventFilter {
            in_process: Some(true),
            ..MutationEventFilter::default()
        })?;

        if !stale.is_empty() {
            log::info!("Returning {} in-process mutation events to the outbox", stale.len());
        }
        for mut event in stale {
            event.in_process = false;
            storage.save_mutation_event(&event)?;
        }

        Ok(Self {
            storage,
            appended: Notify::new(),
        })
    }

    pub fn shared(storage: SharedStorage) -> DataStoreResult<Arc<Self>> {
        Ok(Arc::new(Self::new(storage)?))
    }

    /// Append a local change. Returns the event now standing for the change,
    /// or `None` when it cancelled out a pending create.
    pub fn append(&self, candidate: MutationEvent) -> DataStoreResult<Option<MutationEvent>> {
        let mut saved = None;
        self.storage.transaction(&mut |tx| {
            saved = Self::append_in(tx, &candidate)?;
            Ok(())
        })?;
        self.notify_appended();
        Ok(saved)
    }

    /// Coalescing append against an adapter, for callers that already hold a
    /// transaction. Call `notify_appended` once it commits.
    pub fn append_in(storage: &dyn StorageAdapter, candidate: &MutationEvent) -> DataStoreResult<Option<MutationEvent>> {
        let existing = storage
            .query_mutation_events(&MutationEventFilter::pending_for(
                &candidate.model_name,
                std::slice::from_ref(&candidate.model_id),
            ))?
            .into_iter()
            .next();

        let Some(existing) = existing else {
            return Ok(Some(storage.save_mutation_event(candidate)?));
        };

        let merged = match (existing.mutation_type, candidate.mutation_type) {
            (MutationType::Create, MutationType::Update) => MutationEvent {
                json: candidate.json.clone(),
                graphql_filter_json: candidate.graphql_filter_json.clone(),
                ..existing
            },
            (MutationType::Create, MutationType::Delete) => {
                log::debug!(
                    "Delete of {} {} cancels its pending create",
                    candidate.model_name,
                    candidate.model_id
                );
                storage.delete_mutation_event(&existing.id)?;
                return Ok(None);
            }
            (MutationType::Update, MutationType::Update) | (MutationType::Update, MutationType::Delete) => {
                MutationEvent {
                    json: candidate.json.clone(),
                    mutation_type: candidate.mutation_type,
                    graphql_filter_json: candidate.graphql_filter_json.clone(),
                    ..existing
                }
            }
            (MutationType::Delete, _) => {
                return Err(DataStoreError::Sync(format!(
                    "Received a {} for {} {} after it was deleted",
                    candidate.mutation_type.as_str(),
                    candidate.model_name,
                    candidate.model_id
                )));
            }
            (_, MutationType::Create) => {
                return Err(DataStoreError::Sync(format!(
                    "Received a create for {} {} which already has a pending {}",
                    candidate.model_name,
                    candidate.model_id,
                    existing.mutation_type.as_str()
                )));
            }
        };

        Ok(Some(storage.save_mutation_event(&merged)?))
    }

    /// Wake a waiting `next_event`
    pub fn notify_appended(&self) {
        self.appended.notify_waiters();
    }

    pub fn pending_events(&self) -> DataStoreResult<Vec<MutationEvent>> {
        Ok(self.storage.query_mutation_events(&MutationEventFilter::pending())?)
    }

    pub fn pending_for(&self, model_name: &str, model_ids: &[String]) -> DataStoreResult<Vec<MutationEvent>> {
        Ok(self
            .storage
            .query_mutation_events(&MutationEventFilter::pending_for(model_name, model_ids))?)
    }

    pub fn delete(&self, id: &str) -> DataStoreResult<()> {
        Ok(self.storage.delete_mutation_event(id)?)
    }

    pub fn stats(&self) -> DataStoreResult<OutboxStats> {
        let events = self.storage.query_mutation_events(&MutationEventFilter::all())?;
        let in_process = events.iter().filter(|e| e.in_process).count();

        Ok(OutboxStats {
            pending: events.len() - in_process,
            in_process,
        })
    }

    fn take_oldest_pending(&self) -> DataStoreResult<Option<MutationEvent>> {
        let mut taken = None;
        self.storage.transaction(&mut |tx| {
            if let Some(mut event) = tx.query_mutation_events(&MutationEventFilter::pending())?.into_iter().next() {
                event.in_process = true;
                taken = Some(tx.save_mutation_event(&event)?);
            }
            Ok(())
        })?;
        Ok(taken)
    }
}

#[async_trait]
impl MutationEventSource for MutationEventLog {
    async fn next_event(&self) -> DataStoreResult<MutationEvent> {
        loop {
            // Register interest before looking so an append in between is not missed
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            match self.take_oldest_pending() {
                Ok(Some(event)) => {
                    log::debug!("Dequeued {} for {} {}", event.mutation_type.as_str(), event.model_name, event.model_id);
                    return Ok(event);
                }
                Ok(None) => appended.await,
                Err(e) => {
                    log::warn!("Failed to read mutation log, retrying: {}", e);
                    tokio::time::sleep(STORAGE_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::models::AnyModel;
    use serde_json::json;

    fn create_test_log() -> (Arc<Database>, MutationEventLog) {
        let db = Arc::new(Database::in_memory().expect("Failed to create test database"));
        let log = MutationEventLog::new(db.clone()).expect("Failed to open mutation log");
        (db, log)
    }

    fn event(id: &str, title: &str, mutation_type: MutationType, version: Option<i64>) -> MutationEvent {
        let model = AnyModel::new("Post", id, json!({"id": id, "title": title}));
        MutationEvent::new(&model, mutation_type, version).unwrap()
    }

    #[test]
    fn test_create_then_update_stays_a_create() {
        let (_db, log) = create_test_log();

        let created = log.append(event("p1", "v1", MutationType::Create, None)).unwrap().unwrap();
        let merged = log.append(event("p1", "v2", MutationType::Update, None)).unwrap().unwrap();

        assert_eq!(merged.id, created.id);
        assert_eq!(merged.mutation_type, MutationType::Create);
        assert_eq!(merged.decode_model().unwrap().instance["title"], "v2");
        assert_eq!(log.pending_events().unwrap().len(), 1);
    }

    #[test]
    fn test_create_then_delete_cancels_out() {
        let (_db, log) = create_test_log();

        log.append(event("p1", "v1", MutationType::Create, None)).unwrap();
        assert!(log.append(event("p1", "v1", MutationType::Delete, None)).unwrap().is_none());
        assert!(log.pending_events().unwrap().is_empty());
    }

    #[test]
    fn test_update_then_delete_becomes_delete() {
        let (_db, log) = create_test_log();

        log.append(event("p1", "v1", MutationType::Update, Some(3))).unwrap();
        let merged = log.append(event("p1", "v1", MutationType::Delete, Some(3))).unwrap().unwrap();

        assert_eq!(merged.mutation_type, MutationType::Delete);
        assert_eq!(merged.version, Some(3));
        assert_eq!(log.pending_events().unwrap().len(), 1);
    }

    #[test]
    fn test_change_after_pending_delete_is_rejected() {
        let (_db, log) = create_test_log();

        log.append(event("p1", "v1", MutationType::Delete, Some(1))).unwrap();
        let err = log.append(event("p1", "v2", MutationType::Update, Some(1))).unwrap_err();
        assert!(matches!(err, DataStoreError::Sync(_)));
    }

    #[tokio::test]
    async fn test_in_process_events_are_not_merged() {
        let (_db, log) = create_test_log();

        log.append(event("p1", "v1", MutationType::Update, Some(1))).unwrap();
        let taken = log.next_event().await.unwrap();
        assert!(taken.in_process);

        log.append(event("p1", "v2", MutationType::Update, Some(1))).unwrap();
        let stats = log.stats().unwrap();
        assert_eq!(stats, OutboxStats { pending: 1, in_process: 1 });
    }

    #[tokio::test]
    async fn test_next_event_waits_for_append() {
        let (_db, log) = create_test_log();
        let log = Arc::new(log);

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.next_event().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        log.append(event("p1", "v1", MutationType::Create, None)).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("next_event did not wake up")
            .unwrap()
            .unwrap();

        assert_eq!(received.model_id, "p1");
        assert!(received.in_process);
    }

    #[tokio::test]
    async fn test_reopening_resets_in_process_events() {
        let (db, log) = create_test_log();

        log.append(event("p1", "v1", MutationType::Create, None)).unwrap();
        log.next_event().await.unwrap();
        assert_eq!(log.stats().unwrap().in_process, 1);

        let reopened = MutationEventLog::new(db).unwrap();
        assert_eq!(reopened.stats().unwrap(), OutboxStats { pending: 1, in_process: 0 });
    }
}

//! Remote model reconciliation rules
//!
//! Pure functions deciding what to do with incoming remote models given the
//! pending local mutations and the locally stored sync metadata.

use std::collections::{HashMap, HashSet};

use super::models::{MutationEvent, MutationSync, MutationSyncMetadata};

/// Local action for one remote model
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Create(MutationSync),
    Update(MutationSync),
    Delete(MutationSync),
}

impl Disposition {
    pub fn remote_model(&self) -> &MutationSync {
        match self {
            Disposition::Create(remote) | Disposition::Update(remote) | Disposition::Delete(remote) => remote,
        }
    }
}

pub struct RemoteSyncReconciler;

impl RemoteSyncReconciler {
    /// Split off remote models that have a pending local mutation. Returns
    /// `(kept, dropped)`.
    pub fn filter(
        remote_models: Vec<MutationSync>,
        pending_mutations: &[MutationEvent],
    ) -> (Vec<MutationSync>, Vec<MutationSync>) {
        let pending: HashSet<&str> = pending_mutations.iter().map(|e| e.model_id.as_str()).collect();
        remote_models
            .into_iter()
            .partition(|remote| !pending.contains(remote.model_id()))
    }

    /// `None` means the remote model is dropped.
    pub fn disposition(remote: MutationSync, local: Option<&MutationSyncMetadata>) -> Option<Disposition> {
        match local {
            None if remote.is_deleted() => None,
            None => Some(Disposition::Create(remote)),
            Some(local) if remote.version() <= local.version => None,
            Some(_) if remote.is_deleted() => Some(Disposition::Delete(remote)),
            Some(_) => Some(Disposition::Update(remote)),
        }
    }

    /// Dispositions for a batch, keeping only the highest version of each id.
    /// Returns `(dispositions, dropped)`.
    pub fn dispositions(
        remote_models: Vec<MutationSync>,
        local_metadata: &[MutationSyncMetadata],
    ) -> (Vec<Disposition>, Vec<MutationSync>) {
        let local: HashMap<&str, &MutationSyncMetadata> =
            local_metadata.iter().map(|m| (m.model_id.as_str(), m)).collect();

        let mut newest: Vec<MutationSync> = Vec::with_capacity(remote_models.len());
        let mut position: HashMap<String, usize> = HashMap::new();
        let mut dropped = Vec::new();

        for remote in remote_models {
            match position.get(remote.model_id()) {
                Some(&index) if newest[index].version() >= remote.version() => dropped.push(remote),
                Some(&index) => {
                    let stale = std::mem::replace(&mut newest[index], remote);
                    dropped.push(stale);
                }
                None => {
                    position.insert(remote.model_id().to_string(), newest.len());
                    newest.push(remote);
                }
            }
        }

        let mut dispositions = Vec::with_capacity(newest.len());
        for remote in newest {
            let metadata = local.get(remote.model_id()).copied();
            match Self::disposition(remote.clone(), metadata) {
                Some(disposition) => dispositions.push(disposition),
                None => dropped.push(remote),
            }
        }

        (dispositions, dropped)
    }
}

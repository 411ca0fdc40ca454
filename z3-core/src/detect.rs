//! Change detection.
//!
//! Turns the remote change listing and the store's local edit markers into
//! per-subject plans: remote-only, local-only or conflicting.

use crate::checkpoint::Checkpoint;
use crate::remote::{RemoteChange, RemoteEntry};
use crate::store::{Result, TripleStore};
use crate::triple::{Fields, ItemKey, SubjectKind};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Local state of a subject that was edited since it was last synced.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    pub key: ItemKey,
    pub kind: SubjectKind,
    /// Remote version the local edit is based on; `None` for creations.
    pub remote_version: Option<u64>,
    pub edit_revision: u64,
    pub fields: Fields,
    /// Local tombstone.
    pub deleted: bool,
}

impl LocalChange {
    pub fn is_creation(&self) -> bool {
        self.remote_version.is_none()
    }
}

/// What to do with one subject this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    RemoteOnly(RemoteEntry),
    LocalOnly(LocalChange),
    Conflict {
        local: LocalChange,
        remote: RemoteEntry,
    },
}

impl Plan {
    pub fn key(&self) -> &ItemKey {
        match self {
            Plan::RemoteOnly(remote) => &remote.key,
            Plan::LocalOnly(local) => &local.key,
            Plan::Conflict { local, .. } => &local.key,
        }
    }

    pub fn kind(&self) -> SubjectKind {
        match self {
            Plan::RemoteOnly(remote) => remote.kind,
            Plan::LocalOnly(local) => local.kind,
            Plan::Conflict { local, .. } => local.kind,
        }
    }
}

/// Remote entries that need applying.
#[derive(Debug, Clone, Default)]
pub struct RemoteDelta {
    pub entries: Vec<RemoteEntry>,
    /// Entries already reflected locally.
    pub unchanged: usize,
}

/// Local edits that need pushing.
#[derive(Debug, Clone, Default)]
pub struct LocalDelta {
    /// Edits of subjects the remote already knows.
    pub changes: Vec<LocalChange>,
    /// Subjects never pushed, in dependency order (collections, then
    /// top-level items, then child items).
    pub creations: Vec<LocalChange>,
}

pub struct ChangeDetector<'a> {
    store: &'a TripleStore,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(store: &'a TripleStore) -> Self {
        Self { store }
    }

    /// Filter `entries` down to what is newer than both the checkpoint and
    /// the store. Later entries for the same key replace earlier ones.
    pub fn remote_delta(&self, checkpoint: &Checkpoint, entries: Vec<RemoteEntry>) -> Result<RemoteDelta> {
        let mut latest: Vec<RemoteEntry> = Vec::with_capacity(entries.len());
        let mut index: HashMap<ItemKey, usize> = HashMap::new();
        for entry in entries {
            match index.get(&entry.key) {
                Some(&i) => latest[i] = entry,
                None => {
                    index.insert(entry.key.clone(), latest.len());
                    latest.push(entry);
                }
            }
        }

        let mut delta = RemoteDelta::default();
        for entry in latest {
            let record = self.store.get_record(&entry.key)?;
            let keep = match &entry.change {
                RemoteChange::Tombstone => match &record {
                    Some(r) => !r.deleted || r.is_dirty(),
                    None => false,
                },
                RemoteChange::Fields(_) => {
                    let seen = checkpoint
                        .item_version(&entry.key)
                        .max(record.as_ref().and_then(|r| r.remote_version));
                    seen.is_none_or(|v| entry.version > v)
                }
            };
            if keep {
                delta.entries.push(entry);
            } else {
                debug!(key = %entry.key, version = entry.version, "remote entry already reflected locally");
                delta.unchanged += 1;
            }
        }
        Ok(delta)
    }

    /// Subjects edited after the checkpoint watermark, plus pending ones,
    /// that still carry unsynced edits.
    pub fn local_delta(&self, checkpoint: &Checkpoint) -> Result<LocalDelta> {
        let mut seen = BTreeSet::new();
        let candidates: Vec<ItemKey> = self
            .store
            .list_changed_since(checkpoint.local_revision)?
            .into_iter()
            .chain(checkpoint.pending.keys().cloned())
            .filter(|k| seen.insert(k.clone()))
            .collect();

        let mut delta = LocalDelta::default();
        for key in candidates {
            let Some(change) = self.local_change(&key)? else {
                continue;
            };
            if change.is_creation() {
                if change.deleted {
                    // created and deleted before ever reaching the remote
                    continue;
                }
                delta.creations.push(change);
            } else {
                delta.changes.push(change);
            }
        }
        delta.creations.sort_by_key(creation_rank);
        Ok(delta)
    }

    /// Current local state of `key` if it has unsynced edits.
    pub fn local_change(&self, key: &ItemKey) -> Result<Option<LocalChange>> {
        let Some(record) = self.store.get_record(key)? else {
            return Ok(None);
        };
        if record.kind == SubjectKind::Library || !record.is_dirty() {
            return Ok(None);
        }
        let item = self.store.get_item(key)?;
        Ok(Some(LocalChange {
            fields: item.fields(),
            key: record.key,
            kind: record.kind,
            remote_version: record.remote_version,
            edit_revision: record.edit_revision,
            deleted: record.deleted,
        }))
    }

    /// Pair remote and local deltas by subject. Remote order is kept, then
    /// local-only subjects follow in edit order.
    pub fn partition(&self, remote: Vec<RemoteEntry>, local: Vec<LocalChange>) -> Vec<Plan> {
        let mut local_by_key: HashMap<ItemKey, LocalChange> =
            local.iter().map(|c| (c.key.clone(), c.clone())).collect();
        let mut plans = Vec::with_capacity(remote.len() + local.len());
        for entry in remote {
            match local_by_key.remove(&entry.key) {
                Some(change) => plans.push(Plan::Conflict {
                    local: change,
                    remote: entry,
                }),
                None => plans.push(Plan::RemoteOnly(entry)),
            }
        }
        for change in local {
            if local_by_key.remove(&change.key).is_some() {
                plans.push(Plan::LocalOnly(change));
            }
        }
        plans
    }
}

fn creation_rank(change: &LocalChange) -> u8 {
    match change.kind {
        SubjectKind::Collection if change.fields.contains("parentCollection") => 1,
        SubjectKind::Collection => 0,
        _ if change.fields.contains("parentItem") => 3,
        _ => 2,
    }
}

//! Sync checkpoint.
//!
//! A plain value handed into each cycle and returned from it; it is persisted
//! (together with the cycle's log entry) only after the cycle completes.

use crate::history::{conn_append, SyncLogEntry};
use crate::report::SubjectOutcome;
use crate::store::{Result, StoreError, TripleStore};
use crate::triple::{ItemKey, SubjectKind};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Last-synced markers, library-wide and per subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Library version everything up to which has been applied locally.
    pub library_version: u64,
    /// Local edit revision watermark: edits at or below it were considered.
    pub local_revision: u64,
    /// Remote version last synced per subject.
    pub items: BTreeMap<ItemKey, u64>,
    /// Subjects skipped or failed, with their kind so they can be re-fetched
    /// even when nothing of them reached the store.
    pub pending: BTreeMap<ItemKey, SubjectKind>,
}

impl Checkpoint {
    pub fn item_version(&self, key: &ItemKey) -> Option<u64> {
        self.items.get(key).copied()
    }

    pub fn is_pending(&self, key: &ItemKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Fold one subject's outcome into the checkpoint.
    ///
    /// Settled subjects advance to their new version; skipped and failed
    /// ones keep the prior version and become pending.
    pub fn record(&mut self, key: &ItemKey, kind: SubjectKind, outcome: &SubjectOutcome) {
        if !outcome.is_settled() {
            self.pending.insert(key.clone(), kind);
            return;
        }
        self.pending.remove(key);
        match (outcome, outcome.version()) {
            (SubjectOutcome::Deleted { purged: true, .. }, _) => {
                self.items.remove(key);
            }
            (_, Some(version)) => {
                self.items.insert(key.clone(), version);
            }
            (_, None) => {}
        }
    }

    /// Carry a subject's checkpoint entry over to a server-assigned key.
    pub fn rename(&mut self, old: &ItemKey, new: &ItemKey) {
        if let Some(v) = self.items.remove(old) {
            self.items.insert(new.clone(), v);
        }
        if let Some(kind) = self.pending.remove(old) {
            self.pending.insert(new.clone(), kind);
        }
    }

    /// Load the persisted checkpoint (empty if none was ever saved).
    pub fn load(store: &TripleStore) -> Result<Self> {
        store.read(|c| {
            let head = c
                .query_row(
                    "SELECT library_version, local_revision FROM sync_checkpoint WHERE id = 1",
                    [],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
                )
                .optional()?;
            let Some((library_version, local_revision)) = head else {
                return Ok(Checkpoint::default());
            };

            let mut checkpoint = Checkpoint {
                library_version: library_version as u64,
                local_revision: local_revision as u64,
                ..Default::default()
            };
            let mut stmt = c.prepare_cached(
                "SELECT subject, item_version, pending, kind FROM sync_checkpoint_items",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, Option<i64>>(1)?,
                        r.get::<_, bool>(2)?,
                        r.get::<_, Option<String>>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (subject, version, pending, kind) in rows {
                let key = ItemKey::new(subject);
                if let Some(v) = version {
                    checkpoint.items.insert(key.clone(), v as u64);
                }
                if pending {
                    let kind = kind
                        .ok_or_else(|| StoreError::Corrupt(format!("pending {} has no kind", key)))
                        .and_then(|k| SubjectKind::from_str(&k).map_err(StoreError::Corrupt))?;
                    checkpoint.pending.insert(key, kind);
                }
            }
            Ok(checkpoint)
        })
    }

    /// Persist the checkpoint, and optionally the cycle's log entry, in one
    /// transaction.
    pub fn save(&self, store: &TripleStore, log: Option<&SyncLogEntry>) -> Result<()> {
        store.transaction(|tx| {
            tx.execute(
                "INSERT INTO sync_checkpoint (id, library_version, local_revision, updated_at) \
                 VALUES (1, ?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET library_version = excluded.library_version, \
                     local_revision = excluded.local_revision, updated_at = excluded.updated_at",
                params![
                    self.library_version as i64,
                    self.local_revision as i64,
                    chrono::Utc::now().timestamp()
                ],
            )?;
            tx.execute("DELETE FROM sync_checkpoint_items", [])?;
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sync_checkpoint_items (subject, item_version, pending, kind) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let keys: BTreeSet<&ItemKey> = self.items.keys().chain(self.pending.keys()).collect();
            for key in keys {
                let kind = self.pending.get(key);
                stmt.execute(params![
                    key.as_str(),
                    self.item_version(key).map(|v| v as i64),
                    kind.is_some(),
                    kind.map(SubjectKind::as_str)
                ])?;
            }
            if let Some(entry) = log {
                conn_append(tx, entry)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ItemKey {
        ItemKey::new(s)
    }

    #[test]
    fn test_record_outcomes() {
        let mut cp = Checkpoint::default();
        cp.items.insert(key("AAAA2222"), 3);
        cp.items.insert(key("BBBB2222"), 3);

        cp.record(&key("AAAA2222"), SubjectKind::Item, &SubjectOutcome::Applied { version: 4 });
        cp.record(&key("BBBB2222"), SubjectKind::Item, &SubjectOutcome::Skipped);
        cp.record(&key("CCCC2222"), SubjectKind::Collection, &SubjectOutcome::Failed("timeout".into()));

        assert_eq!(cp.item_version(&key("AAAA2222")), Some(4));
        assert_eq!(cp.item_version(&key("BBBB2222")), Some(3));
        assert!(cp.is_pending(&key("BBBB2222")));
        assert_eq!(cp.pending.get(&key("CCCC2222")), Some(&SubjectKind::Collection));
        assert_eq!(cp.item_version(&key("CCCC2222")), None);

        cp.record(&key("BBBB2222"), SubjectKind::Item, &SubjectOutcome::Deleted { version: 6, purged: true });
        assert_eq!(cp.item_version(&key("BBBB2222")), None);
        assert!(!cp.is_pending(&key("BBBB2222")));
    }

    #[test]
    fn test_load_empty_then_save_and_reload() {
        let store = TripleStore::open_in_memory().unwrap();
        assert_eq!(Checkpoint::load(&store).unwrap(), Checkpoint::default());

        let mut cp = Checkpoint {
            library_version: 12,
            local_revision: 40,
            ..Default::default()
        };
        cp.items.insert(key("AAAA2222"), 11);
        cp.pending.insert(key("AAAA2222"), SubjectKind::Item);
        cp.pending.insert(key("NEWW2222"), SubjectKind::Collection);
        cp.save(&store, None).unwrap();
        assert_eq!(Checkpoint::load(&store).unwrap(), cp);

        cp.pending.clear();
        cp.save(&store, None).unwrap();
        assert_eq!(Checkpoint::load(&store).unwrap(), cp);
    }

    #[test]
    fn test_rename_moves_entry() {
        let mut cp = Checkpoint::default();
        cp.items.insert(key("LOCAL222"), 0);
        cp.pending.insert(key("LOCAL222"), SubjectKind::Item);
        cp.rename(&key("LOCAL222"), &key("SERVER22"));
        assert_eq!(cp.item_version(&key("SERVER22")), Some(0));
        assert!(cp.is_pending(&key("SERVER22")));
        assert!(!cp.is_pending(&key("LOCAL222")));
    }
}

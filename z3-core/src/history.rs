//! Sync log: one row per completed cycle, kept in the store database.

use crate::store::{Result, TripleStore};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Record of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Library version the cycle started from.
    pub from_version: u64,
    /// Library version reached (`None` if the remote listing failed).
    pub to_version: Option<u64>,
    /// Unix seconds.
    pub timestamp: i64,
    pub synced: u64,
    pub skipped: u64,
    pub failed: u64,
    pub deleted: u64,
    pub uploaded: u64,
    pub downloaded: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

pub(crate) fn conn_append(conn: &Connection, entry: &SyncLogEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_log (from_version, to_version, timestamp, synced, skipped, failed, \
         deleted, uploaded, downloaded, duration_ms, success, error) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            entry.from_version as i64,
            entry.to_version.map(|v| v as i64),
            entry.timestamp,
            entry.synced as i64,
            entry.skipped as i64,
            entry.failed as i64,
            entry.deleted as i64,
            entry.uploaded as i64,
            entry.downloaded as i64,
            entry.duration_ms as i64,
            entry.success,
            entry.error,
        ],
    )?;
    Ok(())
}

impl TripleStore {
    /// Append a log entry on its own.
    pub fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<()> {
        self.transaction(|tx| conn_append(tx, entry))
    }

    /// The last `limit` entries, newest first.
    pub fn recent_sync_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        self.read(|c| {
            let mut stmt = c.prepare_cached(
                "SELECT from_version, to_version, timestamp, synced, skipped, failed, deleted, \
                 uploaded, downloaded, duration_ms, success, error \
                 FROM sync_log ORDER BY id DESC LIMIT ?1",
            )?;
            let entries = stmt
                .query_map(params![limit as i64], |r| {
                    Ok(SyncLogEntry {
                        from_version: r.get::<_, i64>(0)? as u64,
                        to_version: r.get::<_, Option<i64>>(1)?.map(|v| v as u64),
                        timestamp: r.get(2)?,
                        synced: r.get::<_, i64>(3)? as u64,
                        skipped: r.get::<_, i64>(4)? as u64,
                        failed: r.get::<_, i64>(5)? as u64,
                        deleted: r.get::<_, i64>(6)? as u64,
                        uploaded: r.get::<_, i64>(7)? as u64,
                        downloaded: r.get::<_, i64>(8)? as u64,
                        duration_ms: r.get::<_, i64>(9)? as u64,
                        success: r.get(10)?,
                        error: r.get(11)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Most recent entry, if any.
    pub fn latest_sync_log(&self) -> Result<Option<SyncLogEntry>> {
        Ok(self.recent_sync_log(1)?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(from: u64, to: Option<u64>, success: bool) -> SyncLogEntry {
        SyncLogEntry {
            from_version: from,
            to_version: to,
            timestamp: 1_700_000_000,
            synced: 3,
            skipped: 0,
            failed: if success { 0 } else { 1 },
            deleted: 0,
            uploaded: 1,
            downloaded: 0,
            duration_ms: 420,
            success,
            error: (!success).then(|| "1 subject(s) failed".to_string()),
        }
    }

    #[test]
    fn test_append_and_recent() {
        let store = TripleStore::open_in_memory().unwrap();
        assert!(store.latest_sync_log().unwrap().is_none());

        store.append_sync_log(&entry(0, Some(10), true)).unwrap();
        store.append_sync_log(&entry(10, None, false)).unwrap();
        store.append_sync_log(&entry(10, Some(12), true)).unwrap();

        let recent = store.recent_sync_log(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], entry(10, Some(12), true));
        assert_eq!(recent[1], entry(10, None, false));
        assert_eq!(store.latest_sync_log().unwrap(), Some(entry(10, Some(12), true)));
    }
}

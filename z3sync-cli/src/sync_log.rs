//! Human-readable sync log output for `--history`.

pub use z3_core::SyncLogEntry;

use anyhow::Result;
use std::io::Write;
use z3_core::TripleStore;

/// Format a sync log entry for display.
pub fn format_entry(entry: &SyncLogEntry) -> String {
    let date = chrono::DateTime::from_timestamp(entry.timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| entry.timestamp.to_string());

    let status = if entry.success { "OK" } else { "FAILED" };
    let to = entry
        .to_version
        .map(|v| format!("v{}", v))
        .unwrap_or_else(|| "-".to_string());

    format!(
        "[{}] v{}->{} | {} synced, {} uploaded, {} deleted, {} downloaded, {} skipped, {} failed | {}ms | {}{}",
        date,
        entry.from_version,
        to,
        entry.synced,
        entry.uploaded,
        entry.deleted,
        entry.downloaded,
        entry.skipped,
        entry.failed,
        entry.duration_ms,
        status,
        entry
            .error
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default(),
    )
}

/// Print the last `limit` sync log entries, oldest first.
pub fn print_sync_log(store: &TripleStore, limit: usize, writer: &mut dyn Write) -> Result<()> {
    let mut entries = store.recent_sync_log(limit)?;
    if entries.is_empty() {
        writeln!(writer, "No sync log entries found.")?;
        return Ok(());
    }
    entries.reverse();

    writeln!(writer, "Sync Log ({} entries):", entries.len())?;
    writeln!(writer, "{}", "-".repeat(80))?;
    for entry in &entries {
        writeln!(writer, "  {}", format_entry(entry))?;
    }
    writeln!(writer, "{}", "-".repeat(80))?;

    let successes = entries.iter().filter(|e| e.success).count();
    let total_synced: u64 = entries.iter().map(|e| e.synced).sum();
    let total_uploaded: u64 = entries.iter().map(|e| e.uploaded).sum();
    let total_ms: u64 = entries.iter().map(|e| e.duration_ms).sum();
    writeln!(
        writer,
        "Summary: {} syncs ({} successful), {} synced, {} uploaded, {}ms total",
        entries.len(),
        successes,
        total_synced,
        total_uploaded,
        total_ms,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(success: bool) -> SyncLogEntry {
        SyncLogEntry {
            from_version: 10,
            to_version: success.then_some(14),
            timestamp: 0,
            synced: 3,
            skipped: 0,
            failed: if success { 0 } else { 1 },
            deleted: 1,
            uploaded: 2,
            downloaded: 0,
            duration_ms: 250,
            success,
            error: (!success).then(|| "remote: timeout".to_string()),
        }
    }

    #[test]
    fn test_format_entry() {
        assert_eq!(
            format_entry(&entry(true)),
            "[1970-01-01 00:00:00 UTC] v10->v14 | 3 synced, 2 uploaded, 1 deleted, 0 downloaded, 0 skipped, 0 failed | 250ms | OK"
        );
        assert_eq!(
            format_entry(&entry(false)),
            "[1970-01-01 00:00:00 UTC] v10->- | 3 synced, 2 uploaded, 1 deleted, 0 downloaded, 0 skipped, 1 failed | 250ms | FAILED (remote: timeout)"
        );
    }

    #[test]
    fn test_print_sync_log() {
        let store = TripleStore::open_in_memory().unwrap();
        let mut out = Vec::new();
        print_sync_log(&store, 5, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "No sync log entries found.\n");

        store.append_sync_log(&entry(true)).unwrap();
        store.append_sync_log(&entry(false)).unwrap();
        let mut out = Vec::new();
        print_sync_log(&store, 5, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Sync Log (2 entries):"));
        assert!(text.contains("Summary: 2 syncs (1 successful), 6 synced, 4 uploaded, 500ms total"));
        let ok = text.find("| OK").unwrap();
        let failed = text.find("| FAILED").unwrap();
        assert!(ok < failed);
    }
}

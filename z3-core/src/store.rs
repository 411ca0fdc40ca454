//! SQLite-backed triple store
//!
//! Facts live in the `metadata` table keyed by (subject, predicate, ordinal);
//! per-subject provenance (remote version, local edit markers, tombstone)
//! lives in `subjects`. Every write to a subject runs in one transaction so
//! readers never observe a partially replaced item. WAL mode lets the web
//! app read while a sync is writing.

use crate::triple::{Fields, ItemKey, Object, Predicate, RemoteFields, SubjectKind, Triple};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Subject not found: {0}")]
    NotFound(String),

    #[error("Subject already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Where a write comes from; decides how the subject's markers move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// User edit. Marks the subject as changed locally.
    Local,
    /// Remote state applied at `version`. Pending local edits are settled.
    Remote { version: u64 },
    /// Merge result at remote `version` whose local side still awaits upload.
    Merged { version: u64 },
}

/// Provenance and version metadata of one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRecord {
    pub key: ItemKey,
    pub kind: SubjectKind,
    /// Last remote version whose state is reflected locally. `None` means the
    /// subject was created locally and never pushed.
    pub remote_version: Option<u64>,
    /// Store revision of the last local edit.
    pub edit_revision: u64,
    /// Edit revision last reconciled with the remote.
    pub synced_revision: u64,
    pub deleted: bool,
}

impl SubjectRecord {
    pub fn is_dirty(&self) -> bool {
        self.edit_revision > self.synced_revision
    }

    pub fn is_pushed(&self) -> bool {
        self.remote_version.is_some()
    }
}

/// A subject with all of its triples.
#[derive(Debug, Clone)]
pub struct Item {
    pub record: SubjectRecord,
    pub triples: Vec<Triple>,
}

impl Item {
    pub fn fields(&self) -> Fields {
        self.triples
            .iter()
            .map(|t| (t.predicate.clone(), t.object.clone()))
            .collect()
    }
}

impl ToSql for Object {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Object::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Object::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Object::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl FromSql for Object {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Text(t) => Ok(Object::Text(String::from_utf8_lossy(t).into_owned())),
            ValueRef::Integer(i) => Ok(Object::Integer(i)),
            ValueRef::Blob(b) => Ok(Object::Blob(b.to_vec())),
            ValueRef::Real(r) => Ok(Object::Text(r.to_string())),
            ValueRef::Null => Err(FromSqlError::InvalidType),
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metadata (
    subject TEXT NOT NULL,
    predicate TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    object NOT NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (subject, predicate, ordinal)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS metadata_predicate_object
    ON metadata (predicate, object) WHERE typeof(object) != 'blob';
CREATE TABLE IF NOT EXISTS subjects (
    subject TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    remote_version INTEGER,
    remote_digest TEXT,
    edit_revision INTEGER NOT NULL DEFAULT 0,
    synced_revision INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS subjects_edit_revision ON subjects (edit_revision);
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
) WITHOUT ROWID;
INSERT OR IGNORE INTO store_meta (key, value) VALUES ('revision', 0);
CREATE TABLE IF NOT EXISTS sync_checkpoint (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    library_version INTEGER NOT NULL,
    local_revision INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sync_checkpoint_items (
    subject TEXT PRIMARY KEY,
    item_version INTEGER,
    pending INTEGER NOT NULL DEFAULT 0,
    kind TEXT
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_version INTEGER NOT NULL,
    to_version INTEGER,
    timestamp INTEGER NOT NULL,
    synced INTEGER NOT NULL,
    skipped INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    deleted INTEGER NOT NULL,
    uploaded INTEGER NOT NULL,
    downloaded INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    success INTEGER NOT NULL,
    error TEXT
);
";

/// Predicates whose object is the key of another subject.
const REFERENCE_PREDICATES: &[&str] = &["parentItem", "collection", "parentCollection"];

/// Attachment link modes that carry a stored file.
const STORED_FILE_LINK_MODES: &[&str] = &["imported_file", "imported_url", "embedded_image"];

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn conn_next_revision(tx: &Transaction) -> Result<u64> {
    let rev: i64 = tx.query_row(
        "UPDATE store_meta SET value = value + 1 WHERE key = 'revision' RETURNING value",
        [],
        |r| r.get(0),
    )?;
    Ok(to_u64(rev))
}

fn conn_record(conn: &Connection, subject: &str) -> Result<Option<SubjectRecord>> {
    let row = conn
        .query_row(
            "SELECT subject, kind, remote_version, edit_revision, synced_revision, deleted \
             FROM subjects WHERE subject = ?1",
            params![subject],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, bool>(5)?,
                ))
            },
        )
        .optional()?;
    row.map(|(key, kind, remote_version, edit, synced, deleted)| {
        Ok(SubjectRecord {
            key: ItemKey::new(key),
            kind: kind.parse().map_err(StoreError::Corrupt)?,
            remote_version: remote_version.map(to_u64),
            edit_revision: to_u64(edit),
            synced_revision: to_u64(synced),
            deleted,
        })
    })
    .transpose()
}

fn conn_remote_digest(conn: &Connection, subject: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT remote_digest FROM subjects WHERE subject = ?1",
            params![subject],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten())
}

fn conn_triples(conn: &Connection, subject: &str) -> Result<Vec<Triple>> {
    let mut stmt = conn.prepare_cached(
        "SELECT predicate, object, version FROM metadata WHERE subject = ?1 \
         ORDER BY predicate, ordinal",
    )?;
    let mut rows = stmt.query(params![subject])?;
    let mut triples = Vec::new();
    while let Some(row) = rows.next()? {
        let predicate: String = row.get(0)?;
        triples.push(Triple {
            subject: ItemKey::new(subject),
            predicate: Predicate::parse(&predicate),
            object: row.get(1)?,
            version: to_u64(row.get(2)?),
        });
    }
    Ok(triples)
}

fn conn_fields(conn: &Connection, subject: &str) -> Result<Fields> {
    Ok(conn_triples(conn, subject)?
        .into_iter()
        .map(|t| (t.predicate, t.object))
        .collect())
}

/// Insert `fields` for `subject`, numbering values per predicate.
fn conn_insert_fields<'a>(
    tx: &Transaction,
    subject: &str,
    fields: impl IntoIterator<Item = (&'a Predicate, &'a Object)>,
    revision: u64,
) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO metadata (subject, predicate, ordinal, object, version) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut ordinals: Vec<(&str, i64)> = Vec::new();
    for (predicate, object) in fields {
        let name = predicate.name();
        let ordinal = match ordinals.iter_mut().find(|(n, _)| *n == name) {
            Some((_, next)) => {
                *next += 1;
                *next
            }
            None => {
                ordinals.push((name, 0));
                0
            }
        };
        stmt.execute(params![subject, name, ordinal, object, revision as i64])?;
    }
    Ok(())
}

fn conn_upsert_record(
    tx: &Transaction,
    record: &SubjectRecord,
    remote_digest: Option<&str>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO subjects (subject, kind, remote_version, remote_digest, edit_revision, synced_revision, deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(subject) DO UPDATE SET kind = excluded.kind, \
             remote_version = excluded.remote_version, remote_digest = excluded.remote_digest, \
             edit_revision = excluded.edit_revision, synced_revision = excluded.synced_revision, \
             deleted = excluded.deleted",
        params![
            record.key.as_str(),
            record.kind.as_str(),
            record.remote_version.map(|v| v as i64),
            remote_digest,
            record.edit_revision as i64,
            record.synced_revision as i64,
            record.deleted,
        ],
    )?;
    Ok(())
}

fn keys_from(stmt: &mut rusqlite::CachedStatement<'_>, args: impl rusqlite::Params) -> Result<Vec<ItemKey>> {
    let keys = stmt
        .query_map(args, |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys.into_iter().map(ItemKey::new).collect())
}

/// SQLite GLOB pattern where only `*` is a wildcard.
fn glob_pattern(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        match ch {
            '?' => glob.push_str("[?]"),
            '[' => glob.push_str("[[]"),
            _ => glob.push(ch),
        }
    }
    glob
}

/// Local triple store over one SQLite database.
pub struct TripleStore {
    conn: Mutex<Connection>,
}

impl TripleStore {
    /// Open (and bootstrap) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        tracing::debug!(path = %path.display(), "opened triple store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` in an immediate transaction; any error rolls everything back.
    pub(crate) fn transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn();
        f(&conn)
    }

    // ==================== Revisions ====================

    /// Revision counter, bumped by every mutating write.
    pub fn current_revision(&self) -> Result<u64> {
        self.read(|c| {
            let rev: i64 =
                c.query_row("SELECT value FROM store_meta WHERE key = 'revision'", [], |r| r.get(0))?;
            Ok(to_u64(rev))
        })
    }

    /// Highest edit revision over all subjects (0 if none were edited).
    pub fn max_edit_revision(&self) -> Result<u64> {
        self.read(|c| {
            let rev: i64 =
                c.query_row("SELECT COALESCE(MAX(edit_revision), 0) FROM subjects", [], |r| r.get(0))?;
            Ok(to_u64(rev))
        })
    }

    /// Subjects edited locally after `revision`, oldest edit first.
    pub fn list_changed_since(&self, revision: u64) -> Result<Vec<ItemKey>> {
        self.read(|c| {
            let mut stmt = c.prepare_cached(
                "SELECT subject FROM subjects WHERE edit_revision > ?1 ORDER BY edit_revision, subject",
            )?;
            keys_from(&mut stmt, params![revision as i64])
        })
    }

    // ==================== Reads ====================

    pub fn get_record(&self, subject: &ItemKey) -> Result<Option<SubjectRecord>> {
        self.read(|c| conn_record(c, subject.as_str()))
    }

    pub fn get_item(&self, subject: &ItemKey) -> Result<Item> {
        self.read(|c| {
            let record = conn_record(c, subject.as_str())?
                .ok_or_else(|| StoreError::NotFound(subject.to_string()))?;
            let triples = conn_triples(c, subject.as_str())?;
            Ok(Item { record, triples })
        })
    }

    pub fn exists(&self, subject: &ItemKey) -> Result<bool> {
        Ok(self.get_record(subject)?.is_some())
    }

    // ==================== Writes ====================

    /// Replace all triples of `subject` atomically.
    ///
    /// Returns `false` if nothing changed (no revision is consumed then).
    pub fn upsert_triples(
        &self,
        subject: &ItemKey,
        kind: SubjectKind,
        fields: &Fields,
        origin: WriteOrigin,
    ) -> Result<bool> {
        self.transaction(|tx| {
            let existing = conn_record(tx, subject.as_str())?;
            let same_content = match &existing {
                Some(_) => conn_fields(tx, subject.as_str())?.same_content(fields),
                None => false,
            };
            let mut record = existing.clone().unwrap_or(SubjectRecord {
                key: subject.clone(),
                kind,
                remote_version: None,
                edit_revision: 0,
                synced_revision: 0,
                deleted: false,
            });
            let unchanged = |r: &SubjectRecord| same_content && !r.deleted && r.kind == kind;

            match origin {
                WriteOrigin::Local => {
                    if existing.as_ref().is_some_and(unchanged) {
                        return Ok(false);
                    }
                }
                WriteOrigin::Remote { version } => {
                    if existing.as_ref().is_some_and(|r| {
                        unchanged(r) && r.remote_version == Some(version) && !r.is_dirty()
                    }) {
                        return Ok(false);
                    }
                }
                WriteOrigin::Merged { version } => {
                    if existing
                        .as_ref()
                        .is_some_and(|r| unchanged(r) && r.remote_version == Some(version))
                    {
                        return Ok(false);
                    }
                }
            }

            let rev = conn_next_revision(tx)?;
            if !same_content {
                tx.execute("DELETE FROM metadata WHERE subject = ?1", params![subject.as_str()])?;
                conn_insert_fields(tx, subject.as_str(), fields.iter().map(|(p, o)| (p, o)), rev)?;
            }
            record.kind = kind;
            record.deleted = false;
            match origin {
                WriteOrigin::Local => record.edit_revision = rev,
                WriteOrigin::Remote { version } => {
                    record.remote_version = Some(version);
                    record.synced_revision = record.edit_revision;
                }
                WriteOrigin::Merged { version } => record.remote_version = Some(version),
            }
            let digest = fields.remote_part().digest();
            conn_upsert_record(tx, &record, Some(&digest))?;
            Ok(true)
        })
    }

    /// Replace only the remote-schema predicates of `subject` with `remote`
    /// at `version`, keeping local-only predicates.
    pub fn upsert_remote_fields(
        &self,
        subject: &ItemKey,
        kind: SubjectKind,
        remote: &RemoteFields,
        version: u64,
    ) -> Result<bool> {
        let digest = remote.digest();
        self.transaction(|tx| {
            let existing = conn_record(tx, subject.as_str())?;
            if let Some(r) = &existing {
                let stored_digest = conn_remote_digest(tx, subject.as_str())?;
                if stored_digest.as_deref() == Some(digest.as_str())
                    && r.remote_version == Some(version)
                    && r.kind == kind
                    && !r.deleted
                    && !r.is_dirty()
                {
                    return Ok(false);
                }
            }

            let rev = conn_next_revision(tx)?;
            let stored_predicates: Vec<String> = {
                let mut stmt =
                    tx.prepare_cached("SELECT DISTINCT predicate FROM metadata WHERE subject = ?1")?;
                stmt.query_map(params![subject.as_str()], |r| r.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            for predicate in stored_predicates {
                if !Predicate::parse(&predicate).is_local() {
                    tx.execute(
                        "DELETE FROM metadata WHERE subject = ?1 AND predicate = ?2",
                        params![subject.as_str(), predicate],
                    )?;
                }
            }
            let fields = remote.to_fields();
            conn_insert_fields(tx, subject.as_str(), fields.iter().map(|(p, o)| (p, o)), rev)?;

            let mut record = existing.unwrap_or(SubjectRecord {
                key: subject.clone(),
                kind,
                remote_version: None,
                edit_revision: 0,
                synced_revision: 0,
                deleted: false,
            });
            record.kind = kind;
            record.deleted = false;
            record.remote_version = Some(version);
            record.synced_revision = record.edit_revision;
            conn_upsert_record(tx, &record, Some(&digest))?;
            Ok(true)
        })
    }

    /// Store derived data (e.g. an attachment file) under a single-valued
    /// predicate. Edit and sync markers are left alone.
    pub fn put_object(&self, subject: &ItemKey, predicate: &str, object: &Object) -> Result<()> {
        self.transaction(|tx| {
            if conn_record(tx, subject.as_str())?.is_none() {
                return Err(StoreError::NotFound(subject.to_string()));
            }
            let rev = conn_next_revision(tx)?;
            tx.execute(
                "DELETE FROM metadata WHERE subject = ?1 AND predicate = ?2",
                params![subject.as_str(), predicate],
            )?;
            tx.execute(
                "INSERT INTO metadata (subject, predicate, ordinal, object, version) \
                 VALUES (?1, ?2, 0, ?3, ?4)",
                params![subject.as_str(), predicate, object, rev as i64],
            )?;
            Ok(())
        })
    }

    /// Tombstone `subject` without removing its triples.
    pub fn mark_deleted(&self, subject: &ItemKey, origin: WriteOrigin) -> Result<bool> {
        self.transaction(|tx| {
            let mut record = conn_record(tx, subject.as_str())?
                .ok_or_else(|| StoreError::NotFound(subject.to_string()))?;
            if record.deleted && origin == WriteOrigin::Local {
                return Ok(false);
            }
            let rev = conn_next_revision(tx)?;
            record.deleted = true;
            match origin {
                WriteOrigin::Local => record.edit_revision = rev,
                WriteOrigin::Remote { version } => {
                    record.remote_version = Some(version.max(record.remote_version.unwrap_or(0)));
                    record.synced_revision = record.edit_revision;
                }
                WriteOrigin::Merged { version } => record.remote_version = Some(version),
            }
            let digest = conn_remote_digest(tx, subject.as_str())?;
            conn_upsert_record(tx, &record, digest.as_deref())?;
            Ok(true)
        })
    }

    /// Physically remove `subject` and all its triples.
    pub fn purge(&self, subject: &ItemKey) -> Result<bool> {
        self.transaction(|tx| {
            let removed = tx.execute("DELETE FROM subjects WHERE subject = ?1", params![subject.as_str()])?;
            let triples = tx.execute("DELETE FROM metadata WHERE subject = ?1", params![subject.as_str()])?;
            if removed + triples > 0 {
                conn_next_revision(tx)?;
            }
            Ok(removed > 0)
        })
    }

    /// Record a confirmed push: the remote now holds `remote_version`, and
    /// local edits up to `revision` are reconciled.
    pub fn mark_synced(&self, subject: &ItemKey, remote_version: u64, revision: u64) -> Result<()> {
        self.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE subjects SET remote_version = ?2, synced_revision = MAX(synced_revision, ?3) \
                 WHERE subject = ?1",
                params![subject.as_str(), remote_version as i64, revision as i64],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(subject.to_string()));
            }
            Ok(())
        })
    }

    /// Rename a subject (server-assigned key on creation), updating
    /// references held by other subjects.
    pub fn rekey(&self, old: &ItemKey, new: &ItemKey) -> Result<()> {
        if old == new {
            return Ok(());
        }
        self.transaction(|tx| {
            if conn_record(tx, new.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists(new.to_string()));
            }
            let moved = tx.execute(
                "UPDATE subjects SET subject = ?2 WHERE subject = ?1",
                params![old.as_str(), new.as_str()],
            )?;
            if moved == 0 {
                return Err(StoreError::NotFound(old.to_string()));
            }
            tx.execute(
                "UPDATE metadata SET subject = ?2 WHERE subject = ?1",
                params![old.as_str(), new.as_str()],
            )?;
            for predicate in REFERENCE_PREDICATES {
                tx.execute(
                    "UPDATE metadata SET object = ?3 WHERE predicate = ?1 AND object = ?2",
                    params![predicate, old.as_str(), new.as_str()],
                )?;
            }
            conn_next_revision(tx)?;
            Ok(())
        })
    }

    /// Create a new local subject under a fresh Zotero-compatible key.
    pub fn create_item(&self, kind: SubjectKind, fields: &Fields) -> Result<ItemKey> {
        loop {
            let key = ItemKey::generate();
            if self.exists(&key)? {
                continue;
            }
            self.upsert_triples(&key, kind, fields, WriteOrigin::Local)?;
            return Ok(key);
        }
    }

    /// Clear and rewrite the library-level metadata subject.
    pub fn replace_library_metadata(&self, subject: &ItemKey, fields: &Fields, version: u64) -> Result<()> {
        self.transaction(|tx| {
            let rev = conn_next_revision(tx)?;
            tx.execute("DELETE FROM metadata WHERE subject = ?1", params![subject.as_str()])?;
            conn_insert_fields(tx, subject.as_str(), fields.iter().map(|(p, o)| (p, o)), rev)?;
            let record = SubjectRecord {
                key: subject.clone(),
                kind: SubjectKind::Library,
                remote_version: Some(version),
                edit_revision: 0,
                synced_revision: 0,
                deleted: false,
            };
            conn_upsert_record(tx, &record, None)?;
            Ok(())
        })
    }

    // ==================== Read accessors ====================

    /// First object stored under `predicate` for `subject`.
    pub fn attr(&self, subject: &ItemKey, predicate: &str) -> Result<Option<Object>> {
        self.read(|c| {
            Ok(c.query_row(
                "SELECT object FROM metadata WHERE subject = ?1 AND predicate = ?2 ORDER BY ordinal LIMIT 1",
                params![subject.as_str(), predicate],
                |r| r.get(0),
            )
            .optional()?)
        })
    }

    /// Live subjects with `predicate` equal to `pattern`; `*` matches any
    /// run of characters, everything else matches literally.
    pub fn query(&self, predicate: &str, pattern: &str) -> Result<Vec<ItemKey>> {
        self.read(|c| {
            if pattern.contains('*') {
                let mut stmt = c.prepare_cached(
                    "SELECT DISTINCT m.subject FROM metadata m \
                     JOIN subjects s ON s.subject = m.subject AND s.deleted = 0 \
                     WHERE m.predicate = ?1 AND m.object GLOB ?2 ORDER BY m.subject",
                )?;
                keys_from(&mut stmt, params![predicate, glob_pattern(pattern)])
            } else {
                let mut stmt = c.prepare_cached(
                    "SELECT DISTINCT m.subject FROM metadata m \
                     JOIN subjects s ON s.subject = m.subject AND s.deleted = 0 \
                     WHERE m.predicate = ?1 AND m.object = ?2 ORDER BY m.subject",
                )?;
                keys_from(&mut stmt, params![predicate, pattern])
            }
        })
    }

    /// Distinct text values of `predicate` on live subjects, sorted
    /// case-insensitively.
    pub fn distinct_objects(&self, predicate: &str) -> Result<Vec<String>> {
        self.read(|c| {
            let mut stmt = c.prepare_cached(
                "SELECT DISTINCT m.object FROM metadata m \
                 JOIN subjects s ON s.subject = m.subject AND s.deleted = 0 \
                 WHERE m.predicate = ?1 AND typeof(m.object) = 'text'",
            )?;
            let mut values = stmt
                .query_map(params![predicate], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            values.sort_by_key(|v| v.to_lowercase());
            Ok(values)
        })
    }

    /// Child items (notes, attachments, annotations) of `parent`.
    pub fn children(&self, parent: &ItemKey) -> Result<Vec<ItemKey>> {
        self.query("parentItem", parent.as_str())
    }

    /// Keys of all live collections.
    pub fn collections(&self) -> Result<Vec<ItemKey>> {
        self.read(|c| {
            let mut stmt = c.prepare_cached(
                "SELECT subject FROM subjects WHERE kind = 'collection' AND deleted = 0 ORDER BY subject",
            )?;
            keys_from(&mut stmt, [])
        })
    }

    pub fn collection_members(&self, collection: &ItemKey, offset: usize, limit: usize) -> Result<Vec<ItemKey>> {
        self.read(|c| {
            let mut stmt = c.prepare_cached(
                "SELECT m.subject FROM metadata m \
                 JOIN subjects s ON s.subject = m.subject AND s.deleted = 0 \
                 WHERE m.predicate = 'collection' AND m.object = ?1 \
                 ORDER BY m.subject LIMIT ?2 OFFSET ?3",
            )?;
            keys_from(&mut stmt, params![collection.as_str(), limit as i64, offset as i64])
        })
    }

    pub fn collection_member_count(&self, collection: &ItemKey) -> Result<usize> {
        self.read(|c| {
            let n: i64 = c.query_row(
                "SELECT COUNT(*) FROM metadata m \
                 JOIN subjects s ON s.subject = m.subject AND s.deleted = 0 \
                 WHERE m.predicate = 'collection' AND m.object = ?1",
                params![collection.as_str()],
                |r| r.get(0),
            )?;
            Ok(to_u64(n) as usize)
        })
    }

    /// Key of the library metadata subject, if one was downloaded.
    pub fn library_subject(&self) -> Result<Option<ItemKey>> {
        self.read(|c| {
            Ok(c.query_row(
                "SELECT subject FROM subjects WHERE kind = 'library' LIMIT 1",
                [],
                |r| r.get::<_, String>(0),
            )
            .optional()?
            .map(ItemKey::new))
        })
    }

    /// Live attachments whose stored file has not been downloaded yet.
    pub fn attachments_missing_files(&self) -> Result<Vec<ItemKey>> {
        self.read(|c| {
            let mut stmt = c.prepare_cached(
                "SELECT DISTINCT m.subject FROM metadata m JOIN subjects s ON s.subject = m.subject \
                 WHERE m.predicate = 'linkMode' AND m.object IN (?1, ?2, ?3) AND s.deleted = 0 \
                 AND NOT EXISTS (SELECT 1 FROM metadata f WHERE f.subject = m.subject AND f.predicate = 'file') \
                 ORDER BY m.subject",
            )?;
            keys_from(
                &mut stmt,
                params![STORED_FILE_LINK_MODES[0], STORED_FILE_LINK_MODES[1], STORED_FILE_LINK_MODES[2]],
            )
        })
    }
}

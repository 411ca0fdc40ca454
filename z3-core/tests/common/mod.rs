//! In-memory remote library used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use z3_core::merge::overlay;
use z3_core::{
    ChangePage, Fields, ItemKey, LibraryMetadata, PushReceipt, PushRequest, RemoteChange,
    RemoteEntry, RemoteError, RemoteFields, RemoteLibrary, RetryPolicy, SubjectKind,
};

#[derive(Debug, Clone)]
struct StoredObject {
    kind: SubjectKind,
    version: u64,
    fields: RemoteFields,
}

#[derive(Default)]
struct State {
    version: u64,
    objects: BTreeMap<ItemKey, StoredObject>,
    deleted: BTreeMap<ItemKey, (SubjectKind, u64)>,
    files: HashMap<ItemKey, Bytes>,
    pushes: Vec<PushRequest>,
    deletes: Vec<ItemKey>,
    /// Pushes to reject per key, each simulating a concurrent remote edit.
    conflicts: HashMap<ItemKey, u32>,
    /// Transient failures to return from `fetch_changes_page`.
    listing_failures: u32,
    /// Version bumps to apply after serving a first page.
    moves_during_pagination: u32,
    created: u32,
}

/// Versioned library held in memory, behaving like the Zotero API.
pub struct MemoryLibrary {
    state: Mutex<State>,
    page_size: usize,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Write `fields` as another client would; returns the new version.
    pub fn put(&self, key: &str, kind: SubjectKind, fields: Fields) -> u64 {
        let mut state = self.state();
        state.version += 1;
        let version = state.version;
        let key = ItemKey::new(key);
        state.deleted.remove(&key);
        state.objects.insert(
            key,
            StoredObject {
                kind,
                version,
                fields: fields.remote_part(),
            },
        );
        version
    }

    pub fn delete(&self, key: &str) -> u64 {
        let mut state = self.state();
        state.version += 1;
        let version = state.version;
        let key = ItemKey::new(key);
        if let Some(obj) = state.objects.remove(&key) {
            state.deleted.insert(key, (obj.kind, version));
        }
        version
    }

    pub fn put_file(&self, key: &str, contents: &'static [u8]) {
        self.state()
            .files
            .insert(ItemKey::new(key), Bytes::from_static(contents));
    }

    pub fn fields(&self, key: &str) -> Option<Fields> {
        self.state()
            .objects
            .get(&ItemKey::new(key))
            .map(|o| o.fields.to_fields())
    }

    pub fn object_version(&self, key: &str) -> Option<u64> {
        self.state().objects.get(&ItemKey::new(key)).map(|o| o.version)
    }

    pub fn is_deleted(&self, key: &str) -> bool {
        self.state().deleted.contains_key(&ItemKey::new(key))
    }

    pub fn keys(&self) -> Vec<ItemKey> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn version(&self) -> u64 {
        self.state().version
    }

    pub fn pushes(&self) -> Vec<PushRequest> {
        self.state().pushes.clone()
    }

    pub fn deletes(&self) -> Vec<ItemKey> {
        self.state().deletes.clone()
    }

    pub fn inject_conflicts(&self, key: &str, count: u32) {
        self.state().conflicts.insert(ItemKey::new(key), count);
    }

    pub fn fail_listing(&self, count: u32) {
        self.state().listing_failures = count;
    }

    pub fn move_during_pagination(&self, count: u32) {
        self.state().moves_during_pagination = count;
    }

    /// Consume one injected conflict for `key`, bumping its version.
    fn take_conflict(state: &mut State, key: &ItemKey) -> bool {
        let Some(remaining) = state.conflicts.get_mut(key) else {
            return false;
        };
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        state.version += 1;
        let version = state.version;
        if let Some(obj) = state.objects.get_mut(key) {
            obj.version = version;
        }
        true
    }

    fn entry(key: &ItemKey, obj: &StoredObject) -> RemoteEntry {
        RemoteEntry {
            key: key.clone(),
            kind: obj.kind,
            version: obj.version,
            change: RemoteChange::Fields(obj.fields.clone()),
        }
    }
}

#[async_trait]
impl RemoteLibrary for MemoryLibrary {
    async fn fetch_changes_page(
        &self,
        since: u64,
        page: Option<&str>,
    ) -> Result<ChangePage, RemoteError> {
        let mut state = self.state();
        if state.listing_failures > 0 {
            state.listing_failures -= 1;
            return Err(RemoteError::transient("503 Service Unavailable"));
        }
        let offset: usize = page.map(|p| p.parse().unwrap()).unwrap_or(0);
        if offset > 0 && state.moves_during_pagination > 0 {
            state.moves_during_pagination -= 1;
            state.version += 1;
        }

        let mut changed: Vec<RemoteEntry> = state
            .objects
            .iter()
            .filter(|(_, o)| o.version > since)
            .map(|(k, o)| Self::entry(k, o))
            .collect();
        changed.sort_by_key(|e| (e.kind != SubjectKind::Collection, e.version));
        changed.extend(
            state
                .deleted
                .iter()
                .filter(|(_, (_, v))| *v > since)
                .map(|(k, (kind, v))| RemoteEntry::tombstone(k.clone(), *kind, *v)),
        );

        let end = (offset + self.page_size).min(changed.len());
        let entries = changed[offset.min(end)..end].to_vec();
        Ok(ChangePage {
            library_version: state.version,
            entries,
            next_page: (end < changed.len()).then(|| end.to_string()),
        })
    }

    async fn fetch_item(
        &self,
        key: &ItemKey,
        _kind: SubjectKind,
    ) -> Result<Option<RemoteEntry>, RemoteError> {
        let state = self.state();
        Ok(state.objects.get(key).map(|o| Self::entry(key, o)))
    }

    async fn push_item(&self, request: PushRequest) -> Result<PushReceipt, RemoteError> {
        let mut state = self.state();
        state.pushes.push(request.clone());

        let Some(key) = request.key else {
            state.created += 1;
            state.version += 1;
            let key = ItemKey::new(format!("SRV{:05}", state.created));
            let version = state.version;
            state.objects.insert(
                key.clone(),
                StoredObject {
                    kind: request.kind,
                    version,
                    fields: request.fields,
                },
            );
            return Ok(PushReceipt { key, version });
        };

        if Self::take_conflict(&mut state, &key) {
            return Err(RemoteError::Conflict {
                key: key.to_string(),
            });
        }
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(key.to_string()))?;
        if request.expected_version.is_some_and(|v| v != current.version) {
            return Err(RemoteError::Conflict {
                key: key.to_string(),
            });
        }
        state.version += 1;
        let version = state.version;
        let merged = overlay(&current.fields.to_fields(), &request.fields.to_fields()).remote_part();
        state.objects.insert(
            key.clone(),
            StoredObject {
                kind: current.kind,
                version,
                fields: merged,
            },
        );
        Ok(PushReceipt { key, version })
    }

    async fn delete_item(
        &self,
        key: &ItemKey,
        _kind: SubjectKind,
        expected_version: u64,
    ) -> Result<u64, RemoteError> {
        let mut state = self.state();
        state.deletes.push(key.clone());
        if Self::take_conflict(&mut state, key) {
            return Err(RemoteError::Conflict {
                key: key.to_string(),
            });
        }
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(key.to_string()))?;
        if current.version != expected_version {
            return Err(RemoteError::Conflict {
                key: key.to_string(),
            });
        }
        state.version += 1;
        let version = state.version;
        state.objects.remove(key);
        state.deleted.insert(key.clone(), (current.kind, version));
        Ok(version)
    }

    async fn fetch_library_metadata(&self) -> Result<Option<LibraryMetadata>, RemoteError> {
        Ok(Some(LibraryMetadata {
            id: "4711".to_string(),
            name: "Cartography".to_string(),
            description: "Shared map library".to_string(),
            url: "https://www.zotero.org/groups/4711".to_string(),
            version: self.state().version,
        }))
    }

    async fn download_file(&self, key: &ItemKey) -> Result<Bytes, RemoteError> {
        self.state()
            .files
            .get(key)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(key.to_string()))
    }
}

/// Retries without real delays.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

pub fn book(title: &str) -> Fields {
    Fields::new()
        .with("itemType", "book")
        .with("title", title)
        .with("author", "Mercator, Gerardus")
}

//! Remote library contract.
//!
//! The sync core talks to the remote service only through [`RemoteLibrary`]:
//! a versioned, paginated collection of items and collections. The Zotero
//! HTTP implementation lives in the CLI crate.

use crate::retry::{with_retry, RetryPolicy};
use crate::triple::{ItemKey, RemoteFields, SubjectKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times pagination restarts when the library moves underneath it.
const MAX_PAGINATION_RESTARTS: u32 = 3;

/// Errors reported by a remote library.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// The server-side version no longer matches the expected version.
    #[error("Version conflict on {key}")]
    Conflict { key: String },

    #[error("Not found on remote: {0}")]
    NotFound(String),

    /// Network failure, rate limiting or server error.
    #[error("Transient remote failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Not authorised: {0}")]
    Unauthorized(String),

    #[error("Remote protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Remote state of one subject.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Fields(RemoteFields),
    Tombstone,
}

/// One object reported by the remote, at a given version.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub key: ItemKey,
    pub kind: SubjectKind,
    pub version: u64,
    pub change: RemoteChange,
}

impl RemoteEntry {
    pub fn tombstone(key: ItemKey, kind: SubjectKind, version: u64) -> Self {
        Self {
            key,
            kind,
            version,
            change: RemoteChange::Tombstone,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.change, RemoteChange::Tombstone)
    }
}

/// One page of changes since a library version.
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    /// Library version the page was served at.
    pub library_version: u64,
    pub entries: Vec<RemoteEntry>,
    /// Opaque token for the next page; `None` once exhausted.
    pub next_page: Option<String>,
}

/// All changes since a library version, in server order.
#[derive(Debug, Clone, Default)]
pub struct RemoteChanges {
    pub library_version: u64,
    pub entries: Vec<RemoteEntry>,
}

/// Upload of one subject's recognized fields.
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// `None` creates a new remote object.
    pub key: Option<ItemKey>,
    pub kind: SubjectKind,
    /// Version the fields were based on; mismatch yields `Conflict`.
    pub expected_version: Option<u64>,
    pub fields: RemoteFields,
}

/// Key and version assigned by the remote after a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub key: ItemKey,
    pub version: u64,
}

/// Library-level metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LibraryMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: u64,
}

/// Versioned, paginated read/write access to a remote library.
#[async_trait]
pub trait RemoteLibrary: Send + Sync {
    /// Fetch one page of objects changed (or deleted) after `since`.
    async fn fetch_changes_page(
        &self,
        since: u64,
        page: Option<&str>,
    ) -> Result<ChangePage, RemoteError>;

    /// Current remote state of one object; `None` if it no longer exists.
    async fn fetch_item(
        &self,
        key: &ItemKey,
        kind: SubjectKind,
    ) -> Result<Option<RemoteEntry>, RemoteError>;

    /// Create (`key == None`) or partially update an object.
    async fn push_item(&self, request: PushRequest) -> Result<PushReceipt, RemoteError>;

    /// Delete an object; returns the new library version.
    async fn delete_item(
        &self,
        key: &ItemKey,
        kind: SubjectKind,
        expected_version: u64,
    ) -> Result<u64, RemoteError>;

    async fn fetch_library_metadata(&self) -> Result<Option<LibraryMetadata>, RemoteError>;

    /// Contents of an attachment's stored file.
    async fn download_file(&self, key: &ItemKey) -> Result<Bytes, RemoteError>;
}

/// Drain all change pages since `since`.
///
/// Pages are accumulated in order. If the library version moves between
/// pages, pagination starts over so every entry belongs to one snapshot.
pub async fn fetch_changes(
    remote: &dyn RemoteLibrary,
    since: u64,
    retry: &RetryPolicy,
) -> Result<RemoteChanges, RemoteError> {
    let mut restarts = 0u32;
    'restart: loop {
        let mut changes = RemoteChanges::default();
        let mut token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = with_retry(retry, "fetch_changes_page", || {
                remote.fetch_changes_page(since, token.as_deref())
            })
            .await?;
            pages += 1;

            if pages == 1 {
                changes.library_version = page.library_version;
            } else if page.library_version != changes.library_version {
                restarts += 1;
                if restarts > MAX_PAGINATION_RESTARTS {
                    return Err(RemoteError::transient(format!(
                        "library kept changing during pagination ({} restarts)",
                        restarts - 1
                    )));
                }
                warn!(
                    expected = changes.library_version,
                    got = page.library_version,
                    "library version moved during pagination, restarting"
                );
                continue 'restart;
            }

            changes.entries.extend(page.entries);
            match page.next_page {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!(
            since,
            library_version = changes.library_version,
            entries = changes.entries.len(),
            pages,
            "fetched remote changes"
        );
        return Ok(changes);
    }
}

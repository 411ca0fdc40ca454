//! Z3 Core Library
//!
//! Synchronization of a Zotero library with a local SQLite triple store:
//! - Triple model (subjects, tagged predicates, opaque objects)
//! - Zotero schema awareness and JSON conversion
//! - Triple store over rusqlite (WAL mode)
//! - Remote library contract with bounded retry and pagination
//! - Change detection, merge resolution and the sync cycle
//! - Checkpoint and sync log persistence

pub mod triple;
pub mod schema;
pub mod store;
pub mod remote;
pub mod retry;
pub mod checkpoint;
pub mod history;
pub mod detect;
pub mod merge;
pub mod report;
pub mod sync;

pub use triple::{Field, Fields, ItemKey, Object, Predicate, RemoteFields, SubjectKind, Triple};
pub use store::{Item, Result, StoreError, SubjectRecord, TripleStore, WriteOrigin};
pub use remote::{
    fetch_changes, ChangePage, LibraryMetadata, PushReceipt, PushRequest, RemoteChange,
    RemoteChanges, RemoteEntry, RemoteError, RemoteLibrary,
};
pub use retry::{with_retry, RetryPolicy};
pub use checkpoint::Checkpoint;
pub use history::SyncLogEntry;
pub use detect::{ChangeDetector, LocalChange, Plan};
pub use merge::{resolve, MergePolicy, MergeState, Resolution};
pub use report::{SubjectOutcome, SyncReport};
pub use sync::{CycleOutcome, SyncEngine, SyncError, SyncOptions};

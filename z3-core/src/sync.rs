//! Sync orchestration.
//!
//! One cycle pulls the remote change listing, pairs it with local edits,
//! resolves conflicts per subject, applies the results to the store, pushes
//! approved local state and finally advances the checkpoint. Subjects fail
//! individually; only store-level failures abort the cycle.

use crate::checkpoint::Checkpoint;
use crate::detect::{ChangeDetector, LocalChange, Plan};
use crate::merge::{resolve, MergePolicy, Resolution};
use crate::remote::{fetch_changes, PushRequest, RemoteChange, RemoteEntry, RemoteError, RemoteLibrary};
use crate::report::{SubjectOutcome, SyncReport};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{StoreError, TripleStore, WriteOrigin};
use crate::triple::{Fields, ItemKey, Object, RemoteFields, SubjectKind};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Predicate holding a downloaded attachment file.
pub const FILE_PREDICATE: &str = "file";

/// Errors that abort a whole cycle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Knobs of a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub merge_policy: MergePolicy,
    /// Purge remotely deleted subjects instead of tombstoning them.
    pub remove_deleted: bool,
    pub download_files: bool,
    pub get_library_data: bool,
    /// Start from this library version instead of the checkpoint's.
    pub since_version: Option<u64>,
    pub retry: RetryPolicy,
    pub download_concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            merge_policy: MergePolicy::default(),
            remove_deleted: false,
            download_files: false,
            get_library_data: false,
            since_version: None,
            retry: RetryPolicy::default(),
            download_concurrency: 4,
        }
    }
}

/// Result of one cycle: the advanced checkpoint and what happened.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub checkpoint: Checkpoint,
    pub report: SyncReport,
}

/// Result of a push attempt.
enum PushStep {
    Done(SubjectOutcome),
    Conflict,
}

pub struct SyncEngine<'a> {
    store: &'a TripleStore,
    remote: &'a dyn RemoteLibrary,
    options: SyncOptions,
    cancel: Arc<AtomicBool>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a TripleStore, remote: &'a dyn RemoteLibrary, options: SyncOptions) -> Self {
        Self {
            store,
            remote,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned cancellation flag (e.g. set from Ctrl-C).
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Load the checkpoint, run one cycle and persist the result.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let checkpoint = Checkpoint::load(self.store)?;
        if self.options.get_library_data {
            if let Err(e) = self.refresh_library_metadata().await {
                warn!(error = %e, "could not refresh library metadata");
            }
        }

        let outcome = self.run_cycle(&checkpoint).await?;
        outcome
            .checkpoint
            .save(self.store, Some(&outcome.report.log_entry()))?;
        info!(report = %outcome.report, "sync finished");
        Ok(outcome.report)
    }

    /// Replace the library metadata subject with the remote's.
    pub async fn refresh_library_metadata(&self) -> Result<(), SyncError> {
        let metadata = with_retry(&self.options.retry, "fetch_library_metadata", || {
            self.remote.fetch_library_metadata()
        })
        .await?;
        let Some(meta) = metadata else {
            debug!("remote has no library metadata");
            return Ok(());
        };
        let fields = Fields::new()
            .with("name", meta.name.as_str())
            .with("description", meta.description.as_str())
            .with("url", meta.url.as_str());
        self.store
            .replace_library_metadata(&ItemKey::library(&meta.id), &fields, meta.version)?;
        info!(library = %meta.id, name = %meta.name, "library metadata updated");
        Ok(())
    }

    /// Run one cycle starting from `checkpoint`. The store is updated; the
    /// returned checkpoint is not persisted.
    pub async fn run_cycle(&self, checkpoint: &Checkpoint) -> Result<CycleOutcome, SyncError> {
        let started = Instant::now();
        let since = self.options.since_version.unwrap_or(checkpoint.library_version);
        let mut report = SyncReport::new(since);
        let mut next = checkpoint.clone();
        let watermark = self.store.max_edit_revision()?;
        let detector = ChangeDetector::new(self.store);
        let mut outcomes: BTreeMap<ItemKey, (SubjectKind, SubjectOutcome)> = BTreeMap::new();

        info!(since, policy = %self.options.merge_policy, "starting sync cycle");

        let (library_version, mut entries) =
            match fetch_changes(self.remote, since, &self.options.retry).await {
                Ok(changes) => (Some(changes.library_version), changes.entries),
                Err(e) => {
                    warn!(error = %e, "could not list remote changes");
                    report.remote_error = Some(e.to_string());
                    (None, Vec::new())
                }
            };

        let listed: HashSet<ItemKey> = entries
            .iter()
            .filter(|e| !e.is_tombstone())
            .map(|e| e.key.clone())
            .collect();
        for (key, &kind) in checkpoint.pending.iter().filter(|(k, _)| !listed.contains(*k)) {
            if self.is_cancelled() {
                break;
            }
            if kind == SubjectKind::Library {
                continue;
            }
            let record = self.store.get_record(key)?;
            if record.as_ref().is_some_and(|r| !r.is_pushed()) {
                // local creation; pushed with the other creations
                continue;
            }
            match with_retry(&self.options.retry, "fetch_item", || {
                self.remote.fetch_item(key, kind)
            })
            .await
            {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => match record.and_then(|r| r.remote_version) {
                    Some(known) => entries.push(RemoteEntry::tombstone(
                        key.clone(),
                        kind,
                        library_version.unwrap_or(known),
                    )),
                    None => {
                        debug!(key = %key, "pending subject gone remotely before it arrived");
                        next.pending.remove(key);
                        next.items.remove(key);
                    }
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "could not re-fetch pending subject");
                    outcomes.insert(key.clone(), (kind, SubjectOutcome::Failed(e.to_string())));
                }
            }
        }

        let remote_delta = detector.remote_delta(checkpoint, entries)?;
        report.unchanged = remote_delta.unchanged;
        let local_delta = detector.local_delta(checkpoint)?;
        let plans = detector.partition(remote_delta.entries, local_delta.changes);
        debug!(
            plans = plans.len(),
            creations = local_delta.creations.len(),
            "change detection done"
        );

        for plan in plans {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let key = plan.key().clone();
            let kind = plan.kind();
            if outcomes.contains_key(&key) {
                continue;
            }
            let outcome = match self.execute(plan).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(key = %key, error = %e, "subject failed");
                    SubjectOutcome::Failed(e.to_string())
                }
            };
            debug!(key = %key, ?outcome, "subject processed");
            outcomes.insert(key, (kind, outcome));
        }

        for change in local_delta.creations {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let local_key = change.key.clone();
            match self.push_creation(&change).await {
                Ok((key, outcome)) => {
                    if key != local_key {
                        next.rename(&local_key, &key);
                    }
                    debug!(key = %key, "created on remote");
                    outcomes.insert(key, (change.kind, outcome));
                }
                Err(e) => {
                    warn!(key = %local_key, error = %e, "could not create subject on remote");
                    outcomes.insert(local_key, (change.kind, SubjectOutcome::Failed(e.to_string())));
                }
            }
        }

        if self.options.download_files && !self.is_cancelled() {
            self.download_missing_files(&mut report, &mut outcomes).await?;
        }

        if self.is_cancelled() {
            report.cancelled = true;
        }

        for (key, (kind, outcome)) in &outcomes {
            report.record(key, outcome);
            next.record(key, *kind, outcome);
        }
        if !report.cancelled {
            self.settle_pending(checkpoint, &outcomes, &mut next)?;
            if let Some(version) = library_version {
                next.library_version = version;
                report.to_version = Some(version);
            }
            next.local_revision = watermark;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(report = %report, "sync cycle done");
        Ok(CycleOutcome {
            checkpoint: next,
            report,
        })
    }

    /// Pending subjects that nothing touched this cycle are settled once
    /// they carry no unsynced edits. Ones that never reached the store stay
    /// pending until they arrive or the remote reports them gone.
    fn settle_pending(
        &self,
        checkpoint: &Checkpoint,
        outcomes: &BTreeMap<ItemKey, (SubjectKind, SubjectOutcome)>,
        next: &mut Checkpoint,
    ) -> Result<(), StoreError> {
        for key in checkpoint.pending.keys().filter(|k| !outcomes.contains_key(*k)) {
            let Some(record) = self.store.get_record(key)? else {
                continue;
            };
            if record.is_dirty() {
                continue;
            }
            if let Some(version) = record.remote_version {
                next.record(key, record.kind, &SubjectOutcome::Applied { version });
            }
        }
        Ok(())
    }

    async fn execute(&self, plan: Plan) -> Result<SubjectOutcome, SyncError> {
        match plan {
            Plan::RemoteOnly(entry) => Ok(self.apply_remote(&entry)?),
            Plan::LocalOnly(local) => self.reconcile(local, None).await,
            Plan::Conflict { local, remote } => self.reconcile(local, Some(remote)).await,
        }
    }

    /// Resolve, apply and push one locally changed subject. A push conflict
    /// triggers one re-fetch and a second round; a second conflict fails the
    /// subject.
    async fn reconcile(
        &self,
        mut local: LocalChange,
        mut remote: Option<RemoteEntry>,
    ) -> Result<SubjectOutcome, SyncError> {
        for attempt in 0..2 {
            let step = match remote.take() {
                Some(entry) => self.resolve_and_apply(&local, &entry).await?,
                None => self.push_local(&local).await?,
            };
            match step {
                PushStep::Done(outcome) => return Ok(outcome),
                PushStep::Conflict if attempt == 0 => {
                    warn!(key = %local.key, "push conflict, re-fetching");
                    let fetched = with_retry(&self.options.retry, "fetch_item", || {
                        self.remote.fetch_item(&local.key, local.kind)
                    })
                    .await?;
                    let entry = fetched.unwrap_or_else(|| {
                        RemoteEntry::tombstone(
                            local.key.clone(),
                            local.kind,
                            local.remote_version.unwrap_or(0),
                        )
                    });
                    match ChangeDetector::new(self.store).local_change(&local.key)? {
                        Some(current) => {
                            local = current;
                            remote = Some(entry);
                        }
                        None => return Ok(self.apply_remote(&entry)?),
                    }
                }
                PushStep::Conflict => break,
            }
        }
        Ok(SubjectOutcome::Failed(format!(
            "version conflict on {} persisted after re-fetch",
            local.key
        )))
    }

    async fn resolve_and_apply(
        &self,
        local: &LocalChange,
        remote: &RemoteEntry,
    ) -> Result<PushStep, SyncError> {
        let resolution = resolve(self.options.merge_policy, local, remote);
        debug!(key = %local.key, state = ?resolution.state(), "conflict resolved");
        match resolution {
            Resolution::RemoteWins { fields, version } => {
                self.store
                    .upsert_triples(&local.key, remote.kind, &fields, WriteOrigin::Remote { version })?;
                Ok(PushStep::Done(SubjectOutcome::Applied { version }))
            }
            Resolution::LocalWins {
                merged,
                version,
                upload,
            } => {
                self.store
                    .upsert_triples(&local.key, local.kind, &merged, WriteOrigin::Merged { version })?;
                self.push_fields(local, upload, version).await
            }
            Resolution::LocalDelete { version } => self.push_delete(local, version).await,
            Resolution::Deleted { version } => {
                Ok(PushStep::Done(self.delete_locally(&local.key, version)?))
            }
            Resolution::Skipped => Ok(PushStep::Done(SubjectOutcome::Skipped)),
        }
    }

    async fn push_local(&self, local: &LocalChange) -> Result<PushStep, SyncError> {
        let expected = local.remote_version.unwrap_or(0);
        if local.deleted {
            self.push_delete(local, expected).await
        } else {
            self.push_fields(local, local.fields.remote_part(), expected).await
        }
    }

    async fn push_fields(
        &self,
        local: &LocalChange,
        fields: RemoteFields,
        expected: u64,
    ) -> Result<PushStep, SyncError> {
        let pushed = with_retry(&self.options.retry, "push_item", || {
            self.remote.push_item(PushRequest {
                key: Some(local.key.clone()),
                kind: local.kind,
                expected_version: Some(expected),
                fields: fields.clone(),
            })
        })
        .await;
        match pushed {
            Ok(receipt) => {
                self.store
                    .mark_synced(&local.key, receipt.version, local.edit_revision)?;
                Ok(PushStep::Done(SubjectOutcome::Uploaded {
                    version: receipt.version,
                }))
            }
            Err(e) if e.is_conflict() => Ok(PushStep::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn push_delete(&self, local: &LocalChange, expected: u64) -> Result<PushStep, SyncError> {
        let deleted = with_retry(&self.options.retry, "delete_item", || {
            self.remote.delete_item(&local.key, local.kind, expected)
        })
        .await;
        let version = match deleted {
            Ok(version) => version,
            Err(RemoteError::NotFound(_)) => expected,
            Err(e) if e.is_conflict() => return Ok(PushStep::Conflict),
            Err(e) => return Err(e.into()),
        };
        let outcome = if self.options.remove_deleted {
            self.store.purge(&local.key)?;
            SubjectOutcome::Deleted {
                version,
                purged: true,
            }
        } else {
            self.store.mark_synced(&local.key, version, local.edit_revision)?;
            SubjectOutcome::Deleted {
                version,
                purged: false,
            }
        };
        Ok(PushStep::Done(outcome))
    }

    /// Upload a never-pushed subject. Returns the key the remote assigned.
    async fn push_creation(&self, change: &LocalChange) -> Result<(ItemKey, SubjectOutcome), SyncError> {
        // re-read: parents created earlier in this cycle may have been rekeyed
        let fields = self.store.get_item(&change.key)?.fields().remote_part();
        let receipt = with_retry(&self.options.retry, "push_item", || {
            self.remote.push_item(PushRequest {
                key: None,
                kind: change.kind,
                expected_version: None,
                fields: fields.clone(),
            })
        })
        .await?;
        if receipt.key != change.key {
            self.store.rekey(&change.key, &receipt.key)?;
        }
        self.store
            .mark_synced(&receipt.key, receipt.version, change.edit_revision)?;
        Ok((
            receipt.key,
            SubjectOutcome::Uploaded {
                version: receipt.version,
            },
        ))
    }

    fn apply_remote(&self, entry: &RemoteEntry) -> Result<SubjectOutcome, StoreError> {
        match &entry.change {
            RemoteChange::Fields(fields) => {
                let changed =
                    self.store
                        .upsert_remote_fields(&entry.key, entry.kind, fields, entry.version)?;
                debug!(key = %entry.key, version = entry.version, changed, "applied remote state");
                Ok(SubjectOutcome::Applied {
                    version: entry.version,
                })
            }
            RemoteChange::Tombstone => self.delete_locally(&entry.key, entry.version),
        }
    }

    fn delete_locally(&self, key: &ItemKey, version: u64) -> Result<SubjectOutcome, StoreError> {
        if self.options.remove_deleted {
            self.store.purge(key)?;
            Ok(SubjectOutcome::Deleted {
                version,
                purged: true,
            })
        } else {
            self.store.mark_deleted(key, WriteOrigin::Remote { version })?;
            Ok(SubjectOutcome::Deleted {
                version,
                purged: false,
            })
        }
    }

    async fn download_missing_files(
        &self,
        report: &mut SyncReport,
        outcomes: &mut BTreeMap<ItemKey, (SubjectKind, SubjectOutcome)>,
    ) -> Result<(), SyncError> {
        let keys: Vec<ItemKey> = self
            .store
            .attachments_missing_files()?
            .into_iter()
            .filter(|k| !matches!(outcomes.get(k), Some((_, SubjectOutcome::Failed(_)))))
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        info!(count = keys.len(), "downloading attachment files");

        let results: Vec<(ItemKey, Result<bytes::Bytes, RemoteError>)> = stream::iter(keys)
            .map(|key| async move {
                let result = with_retry(&self.options.retry, "download_file", || {
                    self.remote.download_file(&key)
                })
                .await;
                (key, result)
            })
            .buffer_unordered(self.options.download_concurrency.max(1))
            .collect()
            .await;

        for (key, result) in results {
            match result {
                Ok(bytes) => {
                    match self
                        .store
                        .put_object(&key, FILE_PREDICATE, &Object::Blob(bytes.to_vec()))
                    {
                        Ok(()) => {
                            debug!(key = %key, bytes = bytes.len(), "stored attachment file");
                            report.downloaded.push(key);
                        }
                        Err(e) => {
                            outcomes.insert(key, (SubjectKind::Item, SubjectOutcome::Failed(e.to_string())));
                        }
                    }
                }
                Err(RemoteError::NotFound(_)) => {
                    debug!(key = %key, "attachment has no stored file on remote");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "attachment download failed");
                    outcomes.insert(key, (SubjectKind::Item, SubjectOutcome::Failed(e.to_string())));
                }
            }
        }
        Ok(())
    }
}

//! Mirror orchestrator
//!
//! Consumes the classified difference stream under an operator policy and
//! turns each event into at most one reconciling task, submitted to the
//! scheduler through the admission gate. Results flow back to the caller on
//! a bounded stream for display and exit-status aggregation.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt, TryStreamExt};
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::diff::{object_difference, DiffOptions};
use crate::endpoint::{ListOptions, PutOptions, StorageEndpoint};
use crate::error::{MirrorError, Result};
use crate::scheduler::ParallelManager;
use crate::types::{
    ByteCounter, DiffEvent, EntryKind, ListingEntry, Task, TaskAction, TaskResult, TaskSpec,
};

/// Result stream depth between workers and the consumer
const RESULT_BUFFER: usize = 64;

/// Operator policy for one reconciliation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorPolicy {
    /// Overwrite target objects that differ in size/metadata/timestamp
    #[serde(default)]
    pub overwrite: bool,
    /// Remove target objects absent from the source
    #[serde(default)]
    pub remove: bool,
    /// Report what would happen without mutating anything
    #[serde(default)]
    pub dry_run: bool,
    /// Glob patterns; a key matching any of them is skipped on either side
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Time-bounded snapshot: reconcile listings as of this instant
    pub time_reference: Option<DateTime<Utc>>,
    /// Include non-current versions and delete markers in listings
    #[serde(default)]
    pub include_older_versions: bool,
    /// Compare etag/user metadata when classifying same-key pairs
    #[serde(default)]
    pub compare_metadata: bool,
    /// Only copy source entries at least this old, in seconds
    pub older_than: Option<u64>,
    /// Only copy source entries at most this old, in seconds
    pub newer_than: Option<u64>,
    /// Extra metadata stamped onto every copied object
    #[serde(default)]
    pub user_metadata: HashMap<String, String>,
}

impl MirrorPolicy {
    fn compile(&self) -> Result<CompiledPolicy> {
        let mut exclude = Vec::with_capacity(self.exclude.len());
        for raw in &self.exclude {
            let pattern = Pattern::new(raw)
                .map_err(|e| MirrorError::Fatal(format!("bad exclude pattern `{raw}`: {e}")))?;
            exclude.push(pattern);
        }
        Ok(CompiledPolicy {
            policy: self.clone(),
            exclude,
        })
    }
}

/// Policy with exclude globs compiled once per run
#[derive(Debug)]
struct CompiledPolicy {
    policy: MirrorPolicy,
    exclude: Vec<Pattern>,
}

impl CompiledPolicy {
    fn excluded(&self, key: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(key))
    }

    /// Age window filters applied to source entries before copying
    fn age_excluded(&self, entry: &ListingEntry, now: DateTime<Utc>) -> bool {
        let Some(modified) = entry.modified else {
            return false;
        };
        let age = now - modified;
        if let Some(min) = self.policy.older_than {
            if age < Duration::seconds(min as i64) {
                return true;
            }
        }
        if let Some(max) = self.policy.newer_than {
            if age > Duration::seconds(max as i64) {
                return true;
            }
        }
        false
    }
}

/// Handle to a running reconciliation: a stream of task results plus the
/// cancellation token wired through the whole pipeline. Dropping the handle
/// cancels the run, so an abandoned reconciliation cannot keep mutating the
/// target in the background.
#[derive(Debug)]
pub struct Reconciliation {
    results: Pin<Box<async_channel::Receiver<TaskResult>>>,
    cancel: CancelToken,
}

impl Reconciliation {
    /// Stop listing, task emission and in-flight transfers (best effort)
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next result; `None` once the run has fully drained
    pub async fn recv(&self) -> Option<TaskResult> {
        self.results.recv().await.ok()
    }
}

impl Drop for Reconciliation {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for Reconciliation {
    type Item = TaskResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.results.as_mut().poll_next(cx)
    }
}

/// Per-run tally for the presentation layer's exit status
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReconcileSummary {
    pub copied: u64,
    pub removed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes: u64,
}

impl ReconcileSummary {
    pub fn observe(&mut self, result: &TaskResult) {
        match (&result.outcome, result.action, result.dry_run) {
            (Err(_), _, _) => self.failed += 1,
            (Ok(()), _, true) => self.skipped += 1,
            (Ok(()), Some(TaskAction::Copy), false) => {
                self.copied += 1;
                self.bytes += result.bytes;
            }
            (Ok(()), Some(TaskAction::Remove), false) => self.removed += 1,
            (Ok(()), None, false) => {}
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }
}

/// Compose the full pipeline: list both sides, diff, classify under policy,
/// execute on the adaptive scheduler. Fails only when a listing cannot be
/// obtained at all; every later error is reported per key on the stream.
pub async fn prepare_reconciliation(
    source: Arc<dyn StorageEndpoint>,
    target: Arc<dyn StorageEndpoint>,
    policy: MirrorPolicy,
) -> Result<Reconciliation> {
    let compiled = policy.compile()?;
    let cancel = CancelToken::new();

    let list_opts = ListOptions {
        recursive: true,
        include_versions: policy.include_older_versions,
        time_reference: policy.time_reference,
    };
    let source_listing = source
        .list(list_opts.clone())
        .await
        .map_err(|e| MirrorError::Fatal(format!("cannot list {}: {e}", source.location())))?;
    let target_listing = target
        .list(list_opts)
        .await
        .map_err(|e| MirrorError::Fatal(format!("cannot list {}: {e}", target.location())))?;

    let diff_opts = DiffOptions {
        compare_metadata: policy.compare_metadata,
        ..Default::default()
    };
    let events = object_difference(source_listing, target_listing, diff_opts, cancel.clone());

    let (results_tx, results_rx) = async_channel::bounded(RESULT_BUFFER);
    let manager = ParallelManager::new(results_tx.clone());

    tokio::spawn(drive(
        events,
        source,
        target,
        compiled,
        manager,
        results_tx,
        cancel.clone(),
    ));

    Ok(Reconciliation {
        results: Box::pin(results_rx),
        cancel,
    })
}

/// Orchestrator loop: one admitted task or error result per diff event.
/// Back-pressured by the scheduler's intake and the result stream.
async fn drive(
    events: async_channel::Receiver<DiffEvent>,
    source: Arc<dyn StorageEndpoint>,
    target: Arc<dyn StorageEndpoint>,
    compiled: CompiledPolicy,
    manager: Arc<ParallelManager>,
    results: async_channel::Sender<TaskResult>,
    cancel: CancelToken,
) {
    let started = Utc::now();
    let mut submitted: u64 = 0;

    while let Ok(event) = events.recv().await {
        if cancel.is_cancelled() {
            break;
        }

        // Listing errors bypass exclusion: the offending key may be unknown.
        if event.is_error() {
            if let DiffEvent::ListingError { key, error } = event {
                if results.send(TaskResult::failed(None, key, error)).await.is_err() {
                    break;
                }
            }
            continue;
        }

        let key = event.key().to_string();
        let src_suffix = source.location().suffix_of(&key).to_string();
        let tgt_suffix = target.location().suffix_of(&key).to_string();
        if compiled.excluded(&src_suffix) || compiled.excluded(&tgt_suffix) {
            continue;
        }

        let policy = &compiled.policy;
        let outcome = match event {
            DiffEvent::Identical { .. } | DiffEvent::ListingError { .. } => continue,
            DiffEvent::OnlyInSource { source: entry } => {
                if compiled.age_excluded(&entry, started) {
                    continue;
                }
                if entry.delete_marker {
                    // Nothing to copy for a delete marker the target never saw.
                    continue;
                }
                Some(copy_task(
                    Arc::clone(&source),
                    Arc::clone(&target),
                    entry,
                    policy,
                    cancel.clone(),
                ))
            }
            DiffEvent::OnlyInTarget { target: entry } => {
                if !policy.remove && !policy.dry_run {
                    continue;
                }
                Some(remove_task(Arc::clone(&target), entry, policy.dry_run))
            }
            DiffEvent::SizeMismatch { source: entry, .. }
            | DiffEvent::MetadataMismatch { source: entry, .. }
            | DiffEvent::TimestampConflict { source: entry, .. } => {
                if !policy.overwrite && !policy.dry_run {
                    let refusal = TaskResult::failed(
                        Some(TaskAction::Copy),
                        key,
                        MirrorError::OverwriteNotAllowed(target.location().join(&tgt_suffix)),
                    );
                    if results.send(refusal).await.is_err() {
                        break;
                    }
                    continue;
                }
                if compiled.age_excluded(&entry, started) {
                    continue;
                }
                Some(copy_task(
                    Arc::clone(&source),
                    Arc::clone(&target),
                    entry,
                    policy,
                    cancel.clone(),
                ))
            }
            DiffEvent::TypeMismatch { .. } => {
                let refusal = TaskResult::failed(
                    Some(TaskAction::Copy),
                    key,
                    MirrorError::InvalidTarget(target.location().join(&tgt_suffix)),
                );
                if results.send(refusal).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if let Some(task) = outcome {
            if manager.submit(task).await.is_err() {
                break;
            }
            submitted += 1;
        }
    }

    manager.stop_and_wait().await;
    tracing::info!(
        tasks = submitted,
        bytes = manager.sent_bytes(),
        elapsed = %(Utc::now() - started),
        "reconciliation drained"
    );
    // Dropping `results` (and the manager's clone with it) closes the stream.
}

/// Build a Copy task streaming source content into the target
fn copy_task(
    source: Arc<dyn StorageEndpoint>,
    target: Arc<dyn StorageEndpoint>,
    entry: ListingEntry,
    policy: &MirrorPolicy,
    cancel: CancelToken,
) -> Task {
    let spec = TaskSpec {
        action: TaskAction::Copy,
        key: entry.key.clone(),
        size_hint: entry.size,
        barrier: false,
    };
    let dry_run = policy.dry_run;
    let extra_metadata = policy.user_metadata.clone();
    let key = spec.key.clone();

    Task::new(
        spec,
        Box::new(move |counter: ByteCounter| {
            Box::pin(async move {
                if dry_run {
                    return TaskResult::skipped(TaskAction::Copy, key);
                }
                if cancel.is_cancelled() {
                    return TaskResult::failed(
                        Some(TaskAction::Copy),
                        key,
                        MirrorError::Cancelled,
                    );
                }
                match copy_object(&*source, &*target, &entry, extra_metadata, counter, cancel)
                    .await
                {
                    Ok(bytes) => {
                        tracing::debug!(key = %key, bytes, "copied");
                        TaskResult::ok(TaskAction::Copy, key, bytes)
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "copy failed");
                        TaskResult::failed(Some(TaskAction::Copy), key, e)
                    }
                }
            })
        }),
    )
}

/// Build a Remove task against the target
fn remove_task(target: Arc<dyn StorageEndpoint>, entry: ListingEntry, dry_run: bool) -> Task {
    let spec = TaskSpec {
        action: TaskAction::Remove,
        key: entry.key.clone(),
        size_hint: 0,
        barrier: false,
    };
    let key = spec.key.clone();

    Task::new(
        spec,
        Box::new(move |_counter: ByteCounter| {
            Box::pin(async move {
                if dry_run {
                    return TaskResult::skipped(TaskAction::Remove, key);
                }
                match target.remove(&entry.key, entry.version_id.as_deref()).await {
                    Ok(()) => {
                        tracing::debug!(key = %key, "removed");
                        TaskResult::ok(TaskAction::Remove, key, 0)
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "remove failed");
                        TaskResult::failed(Some(TaskAction::Remove), key, e)
                    }
                }
            })
        }),
    )
}

/// Stream one object from source to target, counting bytes as they move.
/// The token is checked at every chunk boundary, so an in-flight transfer
/// stops within one chunk of cancellation. The target either fully replaces
/// the object or reports failure; partial writes are the endpoint's
/// responsibility to prevent.
async fn copy_object(
    source: &dyn StorageEndpoint,
    target: &dyn StorageEndpoint,
    entry: &ListingEntry,
    extra_metadata: HashMap<String, String>,
    counter: ByteCounter,
    cancel: CancelToken,
) -> Result<u64> {
    let mut metadata = entry.user_metadata.clone();
    metadata.extend(extra_metadata);
    let put_opts = PutOptions {
        user_metadata: metadata,
        modified: entry.modified,
    };

    if entry.kind == EntryKind::Dir {
        let empty = futures::stream::empty();
        return target.put(&entry.key, Box::pin(empty), put_opts).await;
    }

    let content = source
        .get(&entry.key)
        .await?
        .map(move |chunk| {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            chunk
        })
        .inspect_ok(move |chunk| counter.add(chunk.len() as u64));
    target.put(&entry.key, Box::pin(content), put_opts).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: MirrorPolicy = serde_json::from_str(r#"{"overwrite": true}"#).unwrap();
        assert!(policy.overwrite);
        assert!(!policy.remove);
        assert!(policy.exclude.is_empty());
    }

    #[test]
    fn test_bad_exclude_pattern_is_fatal() {
        let policy = MirrorPolicy {
            exclude: vec!["[".to_string()],
            ..Default::default()
        };
        let err = policy.compile().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_exclude_matching() {
        let policy = MirrorPolicy {
            exclude: vec!["*.tmp".to_string(), "logs/*".to_string()],
            ..Default::default()
        };
        let compiled = policy.compile().unwrap();
        assert!(compiled.excluded("scratch.tmp"));
        assert!(compiled.excluded("logs/app.log"));
        assert!(!compiled.excluded("data/app.log"));
    }

    #[test]
    fn test_age_window() {
        let now = Utc::now();
        let policy = MirrorPolicy {
            older_than: Some(3600),
            ..Default::default()
        };
        let compiled = policy.compile().unwrap();

        let fresh = ListingEntry::file("a", 1).with_modified(now - Duration::seconds(60));
        let aged = ListingEntry::file("b", 1).with_modified(now - Duration::seconds(7200));
        assert!(compiled.age_excluded(&fresh, now));
        assert!(!compiled.age_excluded(&aged, now));
    }

    #[tokio::test]
    async fn test_copy_aborts_at_chunk_boundary_after_cancel() {
        use crate::endpoint::MemoryEndpoint;
        use crate::types::{BackendKind, StorageLocation};

        let source =
            MemoryEndpoint::new(StorageLocation::new("src", "b", BackendKind::ObjectStore));
        let target =
            MemoryEndpoint::new(StorageLocation::new("tgt", "b", BackendKind::ObjectStore));
        source.insert("big", vec![7u8; 200_000]);
        let entry = source.stat("big").await.unwrap().unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let counter = ByteCounter::new();

        let err = copy_object(
            &source,
            &target,
            &entry,
            HashMap::new(),
            counter.clone(),
            cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MirrorError::Cancelled));
        assert!(!target.contains("big"));
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_summary_aggregation() {
        let mut summary = ReconcileSummary::default();
        summary.observe(&TaskResult::ok(TaskAction::Copy, "a", 10));
        summary.observe(&TaskResult::ok(TaskAction::Remove, "b", 0));
        summary.observe(&TaskResult::skipped(TaskAction::Copy, "c"));
        summary.observe(&TaskResult::failed(
            None,
            "d",
            MirrorError::Listing {
                key: "d".into(),
                message: "boom".into(),
            },
        ));

        assert_eq!(summary.copied, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.bytes, 10);
        assert_eq!(summary.exit_code(), 1);
    }
}

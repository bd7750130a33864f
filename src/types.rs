//! Core types for mirrorsync

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

/// Kind of backend behind a storage location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    ObjectStore,
    Filesystem,
}

/// Kind of a listed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

impl Default for EntryKind {
    fn default() -> Self {
        EntryKind::File
    }
}

/// One side of a sync: an aliased bucket/prefix or filesystem tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Configured alias for the endpoint (e.g. "play", "local")
    pub alias: String,
    /// Root path or prefix under the alias
    pub root: String,
    pub backend: BackendKind,
    /// Path separator used by the backend
    #[serde(default = "default_separator")]
    pub separator: char,
}

fn default_separator() -> char {
    '/'
}

impl StorageLocation {
    pub fn new(alias: impl Into<String>, root: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            alias: alias.into(),
            root: root.into(),
            backend,
            separator: '/',
        }
    }

    /// Key suffix relative to this location's root. Keys handed out by
    /// listings are already root-relative; this also accepts full paths.
    /// The root only strips at a separator boundary, so `bucket` never
    /// swallows the front of `buckets/file`.
    pub fn suffix_of<'a>(&self, key: &'a str) -> &'a str {
        let root = self.root.trim_end_matches(self.separator);
        if root.is_empty() {
            return key;
        }
        match key.strip_prefix(root) {
            Some("") => "",
            Some(rest) if rest.starts_with(self.separator) => {
                rest.trim_start_matches(self.separator)
            }
            _ => key,
        }
    }

    /// Full display path for a root-relative key
    pub fn join(&self, suffix: &str) -> String {
        let root = self.root.trim_end_matches(self.separator);
        if root.is_empty() {
            format!("{}{}{}", self.alias, self.separator, suffix)
        } else {
            format!("{}{}{}{}{}", self.alias, self.separator, root, self.separator, suffix)
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.alias, self.separator, self.root)
    }
}

/// One entry of a listing
///
/// Within a single listing, keys are unique and arrive in ascending
/// lexicographic order; the difference engine depends on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// Key relative to the listed root
    pub key: String,
    /// Object size in bytes (0 for directories)
    #[serde(default)]
    pub size: u64,
    /// Last-modified timestamp, when the backend reports one
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub kind: EntryKind,
    /// Version identifier on versioned backends
    pub version_id: Option<String>,
    /// Content checksum / etag, when the backend reports one
    pub etag: Option<String>,
    /// User-defined metadata
    #[serde(default)]
    pub user_metadata: HashMap<String, String>,
    /// Whether this version is a delete marker
    #[serde(default)]
    pub delete_marker: bool,
}

impl ListingEntry {
    /// File entry with the given key and size
    pub fn file(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            modified: None,
            kind: EntryKind::File,
            version_id: None,
            etag: None,
            user_metadata: HashMap::new(),
            delete_marker: false,
        }
    }

    /// Directory entry with the given key
    pub fn dir(key: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Dir,
            ..Self::file(key, 0)
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_metadata.insert(key.into(), value.into());
        self
    }
}

/// Classified difference for one key across the two listings
///
/// Exactly one event is produced per distinct key observed across both
/// sides, in ascending key order.
#[derive(Debug)]
pub enum DiffEvent {
    /// Present on both sides with matching attributes
    Identical {
        source: ListingEntry,
        target: ListingEntry,
    },
    /// Present only in the source listing
    OnlyInSource { source: ListingEntry },
    /// Present only in the target listing
    OnlyInTarget { target: ListingEntry },
    /// Same key, different entry kinds (file vs directory)
    TypeMismatch {
        source: ListingEntry,
        target: ListingEntry,
    },
    /// Same key, different sizes
    SizeMismatch {
        source: ListingEntry,
        target: ListingEntry,
    },
    /// Same key, different etag or user metadata
    MetadataMismatch {
        source: ListingEntry,
        target: ListingEntry,
    },
    /// Same key, timestamp strategy flagged a conflict
    TimestampConflict {
        source: ListingEntry,
        target: ListingEntry,
    },
    /// A listing failed to produce the entry at this position
    ListingError { key: String, error: MirrorError },
}

impl DiffEvent {
    /// The key this event is about
    pub fn key(&self) -> &str {
        match self {
            DiffEvent::Identical { source, .. }
            | DiffEvent::OnlyInSource { source }
            | DiffEvent::TypeMismatch { source, .. }
            | DiffEvent::SizeMismatch { source, .. }
            | DiffEvent::MetadataMismatch { source, .. }
            | DiffEvent::TimestampConflict { source, .. } => &source.key,
            DiffEvent::OnlyInTarget { target } => &target.key,
            DiffEvent::ListingError { key, .. } => key,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, DiffEvent::ListingError { .. })
    }
}

/// Reconciling action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Copy,
    Remove,
}

/// Metadata describing a task, carried through to its result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub action: TaskAction,
    /// Root-relative key the task operates on
    pub key: String,
    /// Estimated bytes the task will move, for memory admission
    #[serde(default)]
    pub size_hint: u64,
    /// Must not run concurrently with any other task
    #[serde(default)]
    pub barrier: bool,
}

/// Boxed unit of work executed by a scheduler worker
pub type TaskFn = Box<dyn FnOnce(ByteCounter) -> BoxFuture<'static, TaskResult> + Send + 'static>;

/// A copy/remove action waiting to be executed
///
/// Owned exclusively by the scheduler from submission to completion.
pub struct Task {
    pub spec: TaskSpec,
    work: TaskFn,
}

impl Task {
    pub fn new(spec: TaskSpec, work: TaskFn) -> Self {
        Self { spec, work }
    }

    /// Execute the task, reporting moved bytes through `counter`
    pub async fn run(self, counter: ByteCounter) -> TaskResult {
        (self.work)(counter).await
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("spec", &self.spec).finish()
    }
}

/// Outcome of one executed (or refused) task
#[derive(Debug)]
pub struct TaskResult {
    /// The action that produced this result; `None` for results that never
    /// became a task (listing errors, policy refusals)
    pub action: Option<TaskAction>,
    pub key: String,
    /// Bytes actually transferred
    pub bytes: u64,
    pub outcome: Result<(), MirrorError>,
    /// The task reported what it would do without touching the target
    pub dry_run: bool,
}

impl TaskResult {
    pub fn ok(action: TaskAction, key: impl Into<String>, bytes: u64) -> Self {
        Self {
            action: Some(action),
            key: key.into(),
            bytes,
            outcome: Ok(()),
            dry_run: false,
        }
    }

    pub fn failed(action: Option<TaskAction>, key: impl Into<String>, error: MirrorError) -> Self {
        Self {
            action,
            key: key.into(),
            bytes: 0,
            outcome: Err(error),
            dry_run: false,
        }
    }

    pub fn skipped(action: TaskAction, key: impl Into<String>) -> Self {
        Self {
            action: Some(action),
            key: key.into(),
            bytes: 0,
            outcome: Ok(()),
            dry_run: true,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Shared, lock-free byte counter
///
/// Tasks add transferred bytes; the throughput monitor reads it on a fixed
/// interval. Reads are eventually consistent and never block writers.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_suffix() {
        let loc = StorageLocation::new("play", "bucket/photos", BackendKind::ObjectStore);
        assert_eq!(loc.suffix_of("bucket/photos/2024/a.jpg"), "2024/a.jpg");
        assert_eq!(loc.suffix_of("2024/a.jpg"), "2024/a.jpg");
    }

    #[test]
    fn test_location_join() {
        let loc = StorageLocation::new("play", "bucket", BackendKind::ObjectStore);
        assert_eq!(loc.join("a/b.txt"), "play/bucket/a/b.txt");

        let bare = StorageLocation::new("local", "", BackendKind::Filesystem);
        assert_eq!(bare.join("a/b.txt"), "local/a/b.txt");
    }

    #[test]
    fn test_diff_event_key() {
        let ev = DiffEvent::OnlyInTarget {
            target: ListingEntry::file("x/y", 3),
        };
        assert_eq!(ev.key(), "x/y");
        assert!(!ev.is_error());
    }

    #[test]
    fn test_byte_counter() {
        let counter = ByteCounter::new();
        let clone = counter.clone();
        counter.add(10);
        clone.add(5);
        assert_eq!(counter.get(), 15);
    }
}

//! Content difference engine
//!
//! Synchronized merge ("zipper") over two ascending listings, producing one
//! classified [`DiffEvent`] per distinct key. Runs as a spawned producer
//! feeding a bounded channel: O(n+m) time, O(1) memory beyond the two
//! cursors, back-pressured by the consumer. A read error on either listing
//! surfaces as a `ListingError` event and the merge continues past it.

use std::cmp::Ordering;
use std::sync::Arc;

use async_channel::Sender;
use futures::StreamExt;

use crate::cancel::CancelToken;
use crate::endpoint::EntryStream;
use crate::error::MirrorError;
use crate::types::{DiffEvent, ListingEntry};

/// Channel depth between the merge producer and the orchestrator
const EVENT_BUFFER: usize = 64;

/// Pluggable tie-break for same-key timestamp comparison
///
/// Multi-writer setups disagree on resolution order, so the rule is a
/// strategy rather than a constant.
pub trait TimestampStrategy: Send + Sync {
    /// Whether the pair constitutes a conflict that needs reconciling
    fn is_conflict(&self, source: &ListingEntry, target: &ListingEntry) -> bool;
}

/// Default strategy: the source is authoritative, a strictly newer source
/// modification time means the target is stale.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceAuthoritative;

impl TimestampStrategy for SourceAuthoritative {
    fn is_conflict(&self, source: &ListingEntry, target: &ListingEntry) -> bool {
        match (source.modified, target.modified) {
            (Some(src), Some(tgt)) => src > tgt,
            _ => false,
        }
    }
}

/// Comparison knobs for the merge
#[derive(Clone)]
pub struct DiffOptions {
    /// Compare etag and user metadata in addition to kind/size
    pub compare_metadata: bool,
    pub timestamps: Arc<dyn TimestampStrategy>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            compare_metadata: false,
            timestamps: Arc::new(SourceAuthoritative),
        }
    }
}

impl std::fmt::Debug for DiffOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffOptions")
            .field("compare_metadata", &self.compare_metadata)
            .finish()
    }
}

/// Merge two ascending listings into a stream of classified events.
///
/// Dropping the returned receiver (or firing `cancel`) terminates the merge
/// promptly and releases both underlying listings.
pub fn object_difference(
    source: EntryStream,
    target: EntryStream,
    opts: DiffOptions,
    cancel: CancelToken,
) -> async_channel::Receiver<DiffEvent> {
    let (tx, rx) = async_channel::bounded(EVENT_BUFFER);
    tokio::spawn(run_merge(source, target, opts, cancel, tx));
    rx
}

async fn run_merge(
    mut source: EntryStream,
    mut target: EntryStream,
    opts: DiffOptions,
    cancel: CancelToken,
    tx: Sender<DiffEvent>,
) {
    let mut src = pull(&mut source, &tx, &cancel).await;
    let mut tgt = pull(&mut target, &tx, &cancel).await;

    // Events for the current key are emitted before either cursor advances,
    // so listing errors surfaced by `pull` cannot jump ahead in key order.
    loop {
        match (src.take(), tgt.take()) {
            (Some(s), Some(t)) => match s.key.cmp(&t.key) {
                Ordering::Less => {
                    if !emit(&tx, &cancel, DiffEvent::OnlyInSource { source: s }).await {
                        return;
                    }
                    tgt = Some(t);
                    src = pull(&mut source, &tx, &cancel).await;
                }
                Ordering::Greater => {
                    if !emit(&tx, &cancel, DiffEvent::OnlyInTarget { target: t }).await {
                        return;
                    }
                    src = Some(s);
                    tgt = pull(&mut target, &tx, &cancel).await;
                }
                Ordering::Equal => {
                    if !emit(&tx, &cancel, classify(s, t, &opts)).await {
                        return;
                    }
                    src = pull(&mut source, &tx, &cancel).await;
                    tgt = pull(&mut target, &tx, &cancel).await;
                }
            },
            (Some(s), None) => {
                if !emit(&tx, &cancel, DiffEvent::OnlyInSource { source: s }).await {
                    return;
                }
                src = pull(&mut source, &tx, &cancel).await;
            }
            (None, Some(t)) => {
                if !emit(&tx, &cancel, DiffEvent::OnlyInTarget { target: t }).await {
                    return;
                }
                tgt = pull(&mut target, &tx, &cancel).await;
            }
            (None, None) => return,
        }
    }
}

/// Advance one cursor. Read errors are forwarded as `ListingError` events
/// and the cursor keeps advancing past them (best-effort diffing).
async fn pull(
    stream: &mut EntryStream,
    tx: &Sender<DiffEvent>,
    cancel: &CancelToken,
) -> Option<ListingEntry> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match stream.next().await {
            Some(Ok(entry)) => return Some(entry),
            Some(Err(error)) => {
                let key = match &error {
                    MirrorError::Listing { key, .. } => key.clone(),
                    _ => String::new(),
                };
                if !emit(tx, cancel, DiffEvent::ListingError { key, error }).await {
                    return None;
                }
            }
            None => return None,
        }
    }
}

/// Send one event; `false` means the consumer is gone or the run was
/// cancelled and the merge must stop.
async fn emit(tx: &Sender<DiffEvent>, cancel: &CancelToken, event: DiffEvent) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Classify a same-key pair: kind, then size, then metadata, then the
/// timestamp strategy.
fn classify(source: ListingEntry, target: ListingEntry, opts: &DiffOptions) -> DiffEvent {
    if source.kind != target.kind {
        return DiffEvent::TypeMismatch { source, target };
    }
    if source.size != target.size {
        return DiffEvent::SizeMismatch { source, target };
    }
    if opts.compare_metadata && metadata_differs(&source, &target) {
        return DiffEvent::MetadataMismatch { source, target };
    }
    if opts.timestamps.is_conflict(&source, &target) {
        return DiffEvent::TimestampConflict { source, target };
    }
    DiffEvent::Identical { source, target }
}

fn metadata_differs(source: &ListingEntry, target: &ListingEntry) -> bool {
    if let (Some(src), Some(tgt)) = (&source.etag, &target.etag) {
        if src != tgt {
            return true;
        }
    }
    source.user_metadata != target.user_metadata
}

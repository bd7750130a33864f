//! Storage endpoint capability contract
//!
//! The reconciliation core never talks to a backend directly; it consumes
//! this contract, so the same pipeline synchronizes filesystem↔object-store
//! or object-store↔object-store pairs identically. Transport concerns
//! (signing, syscalls, retries on the wire) live behind implementations.

mod memory;

pub use memory::MemoryEndpoint;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ListingEntry, StorageLocation};

/// Lazy ascending sequence of listing entries
///
/// Finite and restartable per `list` call; never shared across calls.
/// An `Err` item stands for one unreadable position, the stream may
/// continue past it.
pub type EntryStream = BoxStream<'static, Result<ListingEntry>>;

/// Chunked object content
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Options for a single listing call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    /// Descend into subdirectories/prefixes
    #[serde(default)]
    pub recursive: bool,
    /// Include non-current versions and delete markers
    #[serde(default)]
    pub include_versions: bool,
    /// Time-bounded snapshot: exclude entries modified after this instant
    pub time_reference: Option<DateTime<Utc>>,
}

impl ListOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Self::default()
        }
    }
}

/// Options for a single put call
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// User metadata to stamp on the stored object
    pub user_metadata: HashMap<String, String>,
    /// Last-modified to preserve from the source, when the backend allows it
    pub modified: Option<DateTime<Utc>>,
}

/// Uniform listing/read/write capability over one storage location
#[async_trait]
pub trait StorageEndpoint: Send + Sync {
    /// The location this endpoint is bound to
    fn location(&self) -> &StorageLocation;

    /// List entries under the root in ascending lexicographic key order
    async fn list(&self, opts: ListOptions) -> Result<EntryStream>;

    /// Stat a single key; `Ok(None)` when absent
    async fn stat(&self, key: &str) -> Result<Option<ListingEntry>>;

    /// Read object content
    async fn get(&self, key: &str) -> Result<ByteStream>;

    /// Write object content, replacing any existing object atomically.
    /// Returns the number of bytes stored.
    async fn put(&self, key: &str, data: ByteStream, opts: PutOptions) -> Result<u64>;

    /// Remove a key (a specific version when `version_id` is given)
    async fn remove(&self, key: &str, version_id: Option<&str>) -> Result<()>;
}

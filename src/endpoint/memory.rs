//! In-memory storage endpoint
//!
//! Reference implementation of the [`StorageEndpoint`] contract backed by a
//! sorted map. Used throughout the test suite; supports injecting listing
//! errors at chosen keys to exercise best-effort diffing.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use futures::StreamExt;
use parking_lot::RwLock;

use super::{ByteStream, EntryStream, ListOptions, PutOptions, StorageEndpoint};
use crate::error::{MirrorError, Result};
use crate::types::{EntryKind, ListingEntry, StorageLocation};

#[derive(Debug, Clone)]
struct StoredObject {
    entry: ListingEntry,
    data: Vec<u8>,
}

/// Chunk size used when streaming object content back out
const CHUNK_SIZE: usize = 64 * 1024;

/// In-memory endpoint over a sorted key space
#[derive(Clone)]
pub struct MemoryEndpoint {
    location: StorageLocation,
    store: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    listing_errors: Arc<RwLock<HashSet<String>>>,
    list_failure: Arc<RwLock<Option<String>>>,
}

impl MemoryEndpoint {
    pub fn new(location: StorageLocation) -> Self {
        Self {
            location,
            store: Arc::new(RwLock::new(BTreeMap::new())),
            listing_errors: Arc::new(RwLock::new(HashSet::new())),
            list_failure: Arc::new(RwLock::new(None)),
        }
    }

    /// Store an object with content; `modified` defaults to now
    pub fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        let key = key.into();
        let entry = ListingEntry::file(key.clone(), data.len() as u64).with_modified(Utc::now());
        self.insert_entry(entry, data);
    }

    /// Store an object with a fully specified listing entry
    pub fn insert_entry(&self, entry: ListingEntry, data: Vec<u8>) {
        self.store
            .write()
            .insert(entry.key.clone(), StoredObject { entry, data });
    }

    /// Make the listing fail once it reaches `key`
    pub fn inject_listing_error(&self, key: impl Into<String>) {
        self.listing_errors.write().insert(key.into());
    }

    /// Make `list` itself fail, as an unreachable backend would
    pub fn inject_list_failure(&self, message: impl Into<String>) {
        *self.list_failure.write() = Some(message.into());
    }

    /// Current keys in ascending order
    pub fn keys(&self) -> Vec<String> {
        self.store.read().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.read().contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.store.read().get(key).map(|o| o.data.clone())
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

#[async_trait]
impl StorageEndpoint for MemoryEndpoint {
    fn location(&self) -> &StorageLocation {
        &self.location
    }

    async fn list(&self, opts: ListOptions) -> Result<EntryStream> {
        if let Some(message) = self.list_failure.read().clone() {
            return Err(MirrorError::Unavailable(message));
        }
        let separator = self.location.separator;
        let errors = self.listing_errors.read().clone();
        let entries: Vec<Result<ListingEntry>> = self
            .store
            .read()
            .values()
            .filter(|o| opts.recursive || !o.entry.key.contains(separator))
            .filter(|o| opts.include_versions || !o.entry.delete_marker)
            .filter(|o| match (opts.time_reference, o.entry.modified) {
                (Some(at), Some(modified)) => modified <= at,
                _ => true,
            })
            .map(|o| {
                if errors.contains(&o.entry.key) {
                    Err(MirrorError::Listing {
                        key: o.entry.key.clone(),
                        message: "injected listing failure".to_string(),
                    })
                } else {
                    Ok(o.entry.clone())
                }
            })
            .collect();

        Ok(stream::iter(entries).boxed())
    }

    async fn stat(&self, key: &str) -> Result<Option<ListingEntry>> {
        Ok(self.store.read().get(key).map(|o| o.entry.clone()))
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let data = self
            .store
            .read()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| MirrorError::NotFound(self.location.join(key)))?;

        let chunks: Vec<Result<Vec<u8>>> = data
            .chunks(CHUNK_SIZE.max(1))
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn put(&self, key: &str, mut data: ByteStream, opts: PutOptions) -> Result<u64> {
        let mut buf = Vec::new();
        while let Some(chunk) = data.next().await {
            buf.extend_from_slice(&chunk?);
        }

        let mut entry = ListingEntry::file(key, buf.len() as u64)
            .with_modified(opts.modified.unwrap_or_else(Utc::now));
        entry.user_metadata = opts.user_metadata;
        if key.ends_with(self.location.separator) {
            entry.kind = EntryKind::Dir;
        }
        let size = buf.len() as u64;
        self.insert_entry(entry, buf);
        Ok(size)
    }

    async fn remove(&self, key: &str, _version_id: Option<&str>) -> Result<()> {
        match self.store.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(MirrorError::NotFound(self.location.join(key))),
        }
    }
}

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow, ensure};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::entry::CacheEntry;
use super::index::{CacheIndex, Removed};
use super::key::{CacheKey, VariantBucket, VaryDirectives};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub inspected: usize,
    pub removed: u64,
    pub bytes_reclaimed: u64,
}

/// Bounded, concurrent table of cache entries keyed by (key, variant bucket).
#[derive(Debug)]
pub struct VariantStore {
    index: Mutex<CacheIndex>,
    next_id: AtomicU64,
    max_entry_size: u64,
    max_bytes: u64,
}

impl VariantStore {
    pub fn new(max_entries: usize, max_bytes: u64, max_entry_size: u64) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_entries)
            .ok_or_else(|| anyhow!("cache capacity must be greater than zero"))?;
        ensure!(max_bytes > 0, "cache total capacity must be greater than zero");
        Ok(Self {
            index: Mutex::new(CacheIndex::new(capacity, max_bytes)),
            next_id: AtomicU64::new(1),
            max_entry_size,
            max_bytes,
        })
    }

    /// Vary directives learned for `key`, empty until a representation is stored.
    pub fn directives(&self, key: &CacheKey) -> VaryDirectives {
        self.index.lock().directives(key)
    }

    /// Expired entries read as misses and are dropped on the way out.
    pub fn lookup(&self, key: &CacheKey, bucket: &VariantBucket) -> Option<Arc<CacheEntry>> {
        let entry_key = (*key, bucket.clone());
        let entry = self.index.lock().get(&entry_key)?;
        if entry.is_expired(Instant::now()) {
            trace!(key = %key, bucket = %bucket, "cache entry expired");
            let removed = self.index.lock().remove_if_id_matches(&entry_key, entry.id);
            drop(removed);
            return None;
        }
        Some(entry)
    }

    /// Stores `entry`, replacing whatever the same (key, bucket) held.
    ///
    /// Returns `None` when the entry exceeds the per-entry or total bound.
    pub fn insert(&self, mut entry: CacheEntry, vary: VaryDirectives) -> Option<Arc<CacheEntry>> {
        if entry.size_bytes > self.max_entry_size || entry.size_bytes > self.max_bytes {
            trace!(
                key = %entry.key,
                size = entry.size_bytes,
                "cache entry exceeds size bounds; not stored"
            );
            return None;
        }
        entry.id = self.next_entry_id();
        let entry = Arc::new(entry);
        let Removed { evicted, displaced } = {
            let mut guard = self.index.lock();
            guard.insert(entry.clone(), vary)
        };
        for evicted_entry in &evicted {
            trace!(key = %evicted_entry.key, bucket = %evicted_entry.bucket, "evicted cache entry");
            crate::metrics::record_cache_eviction();
        }
        drop(displaced);
        crate::metrics::record_cache_store();
        Some(entry)
    }

    /// Drops every bucket of `key` and forgets its learned directives.
    pub fn invalidate(&self, key: &CacheKey) -> usize {
        let removed = self.index.lock().remove_key(key);
        let count = removed.len();
        if count > 0 {
            crate::metrics::record_cache_invalidation(count as u64);
        }
        count
    }

    pub fn prune_expired(&self, batch_size: usize) -> SweepStats {
        let mut stats = SweepStats::default();
        if batch_size == 0 {
            return stats;
        }
        let (inspected, removed) = self.index.lock().prune_expired(Instant::now(), batch_size);
        stats.inspected = inspected;
        stats.removed = removed.len() as u64;
        stats.bytes_reclaimed = removed.iter().map(|entry| entry.size_bytes).sum();
        stats
    }

    /// Empties the store; used when draining at shutdown.
    pub fn clear(&self) -> usize {
        let drained = self.index.lock().reset();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.index.lock().bytes_in_use()
    }

    fn next_entry_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

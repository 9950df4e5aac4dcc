use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::time::Instant;

use super::entry::CacheEntry;
use super::key::{CacheKey, VariantBucket, VaryDirectives};

pub(super) type EntryKey = (CacheKey, VariantBucket);

#[derive(Debug, Default)]
struct KeyState {
    buckets: HashSet<VariantBucket>,
    vary: VaryDirectives,
}

/// Entries pushed out of the index by one operation, handed back so they drop outside the lock.
#[derive(Debug, Default)]
pub(super) struct Removed {
    pub evicted: Vec<Arc<CacheEntry>>,
    pub displaced: Vec<Arc<CacheEntry>>,
}

#[derive(Debug)]
pub(super) struct CacheIndex {
    lru: LruCache<EntryKey, Arc<CacheEntry>>,
    keys: HashMap<CacheKey, KeyState>,
    bytes_in_use: u64,
    max_bytes: u64,
}

impl CacheIndex {
    pub(super) fn new(capacity: NonZeroUsize, max_bytes: u64) -> Self {
        Self {
            lru: LruCache::new(capacity),
            keys: HashMap::new(),
            bytes_in_use: 0,
            max_bytes,
        }
    }

    pub(super) fn reset(&mut self) -> Vec<Arc<CacheEntry>> {
        self.bytes_in_use = 0;
        self.keys.clear();
        let mut drained = Vec::with_capacity(self.lru.len());
        while let Some((_key, entry)) = self.lru.pop_lru() {
            drained.push(entry);
        }
        drained
    }

    pub(super) fn get(&mut self, key: &EntryKey) -> Option<Arc<CacheEntry>> {
        self.lru.get(key).cloned()
    }

    pub(super) fn directives(&self, key: &CacheKey) -> VaryDirectives {
        self.keys
            .get(key)
            .map(|state| state.vary.clone())
            .unwrap_or_default()
    }

    pub(super) fn remove_if_id_matches(
        &mut self,
        key: &EntryKey,
        entry_id: u64,
    ) -> Option<Arc<CacheEntry>> {
        let matches = self
            .lru
            .peek(key)
            .map(|entry| entry.id == entry_id)
            .unwrap_or(false);
        if matches && let Some(removed) = self.lru.pop(key) {
            self.forget(&removed);
            return Some(removed);
        }
        None
    }

    pub(super) fn remove_key(&mut self, key: &CacheKey) -> Vec<Arc<CacheEntry>> {
        let Some(state) = self.keys.remove(key) else {
            return Vec::new();
        };
        let mut removed = Vec::with_capacity(state.buckets.len());
        for bucket in state.buckets {
            if let Some(entry) = self.lru.pop(&(*key, bucket)) {
                self.bytes_in_use = self.bytes_in_use.saturating_sub(entry.size_bytes);
                removed.push(entry);
            }
        }
        removed
    }

    pub(super) fn insert(&mut self, entry: Arc<CacheEntry>, vary: VaryDirectives) -> Removed {
        let mut removed = Removed::default();

        // Buckets computed under older directives can no longer be addressed.
        let relearned = self
            .keys
            .get(&entry.key)
            .is_some_and(|state| state.vary != vary);
        if relearned {
            removed.displaced = self.remove_key(&entry.key);
        }

        let state = self.keys.entry(entry.key).or_default();
        state.vary = vary;
        state.buckets.insert(entry.bucket.clone());

        let entry_key = (entry.key, entry.bucket.clone());
        self.bytes_in_use = self.bytes_in_use.saturating_add(entry.size_bytes);

        if let Some((pushed_out_key, pushed_out)) = self.lru.push(entry_key.clone(), entry) {
            if pushed_out_key == entry_key {
                self.bytes_in_use = self.bytes_in_use.saturating_sub(pushed_out.size_bytes);
                removed.displaced.push(pushed_out);
            } else {
                self.forget(&pushed_out);
                removed.evicted.push(pushed_out);
            }
        }

        while self.bytes_in_use > self.max_bytes {
            if let Some((_key, evicted)) = self.lru.pop_lru() {
                self.forget(&evicted);
                removed.evicted.push(evicted);
            } else {
                break;
            }
        }

        removed
    }

    /// Removes expired entries among the `batch` least recently used.
    pub(super) fn prune_expired(
        &mut self,
        now: Instant,
        batch: usize,
    ) -> (usize, Vec<Arc<CacheEntry>>) {
        let expired: Vec<EntryKey> = self
            .lru
            .iter()
            .rev()
            .take(batch)
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        let inspected = batch.min(self.lru.len());
        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(entry) = self.lru.pop(&key) {
                self.forget(&entry);
                removed.push(entry);
            }
        }
        (inspected, removed)
    }

    pub(super) fn bytes_in_use(&self) -> u64 {
        self.bytes_in_use
    }

    pub(super) fn len(&self) -> usize {
        self.lru.len()
    }

    pub(super) fn key_count(&self) -> usize {
        self.keys.len()
    }

    // Directives are forgotten with the last bucket of their key.
    fn forget(&mut self, entry: &CacheEntry) {
        self.bytes_in_use = self.bytes_in_use.saturating_sub(entry.size_bytes);
        if let Some(state) = self.keys.get_mut(&entry.key) {
            state.buckets.remove(&entry.bucket);
            if state.buckets.is_empty() {
                self.keys.remove(&entry.key);
            }
        }
    }
}

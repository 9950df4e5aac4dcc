use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::error::CacheError;
use super::index::EntryKey;

pub(super) type Shared<T> = Result<Arc<T>, CacheError>;
type Slot<T> = watch::Sender<Option<Shared<T>>>;

/// Registry of in-flight origin fetches, at most one per (key, bucket).
#[derive(Debug)]
pub(super) struct Coalescer<T> {
    pending: Mutex<HashMap<EntryKey, PendingFetch<T>>>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct PendingFetch<T> {
    id: u64,
    slot: Arc<Slot<T>>,
}

pub(super) enum Joined<T> {
    /// Caller registered the fetch and must run it through `FetchOwner`.
    Owner(FetchOwner<T>, Subscription<T>),
    Waiter(Subscription<T>),
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> Coalescer<T> {
    pub(super) fn join(self: &Arc<Self>, key: EntryKey) -> Joined<T> {
        let mut pending = self.pending.lock();
        if let Some(fetch) = pending.get(&key) {
            return Joined::Waiter(Subscription {
                rx: fetch.slot.subscribe(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let slot = Arc::new(tx);
        pending.insert(
            key.clone(),
            PendingFetch {
                id,
                slot: slot.clone(),
            },
        );
        Joined::Owner(
            FetchOwner {
                coalescer: self.clone(),
                key,
                id,
                slot: Some(slot),
            },
            Subscription { rx },
        )
    }

    pub(super) fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub(super) fn subscribers(&self, key: &EntryKey) -> Option<usize> {
        self.pending
            .lock()
            .get(key)
            .map(|fetch| fetch.slot.receiver_count())
    }

    fn finish(&self, key: &EntryKey, id: u64, result: Option<Shared<T>>, slot: &Slot<T>) {
        let mut pending = self.pending.lock();
        if let Some(result) = result {
            slot.send_replace(Some(result));
        }
        // A newer fetch may already own the key if this one was abandoned and replaced.
        if pending.get(key).is_some_and(|fetch| fetch.id == id) {
            pending.remove(key);
        }
    }
}

/// Publishing half of a pending fetch. Dropping it unpublished abandons the fetch.
pub(super) struct FetchOwner<T> {
    coalescer: Arc<Coalescer<T>>,
    key: EntryKey,
    id: u64,
    slot: Option<Arc<Slot<T>>>,
}

impl<T> FetchOwner<T> {
    pub(super) fn publish(mut self, result: Shared<T>) {
        if let Some(slot) = self.slot.take() {
            self.coalescer.finish(&self.key, self.id, Some(result), &slot);
        }
    }
}

impl<T> Drop for FetchOwner<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            debug!(key = %self.key.0, bucket = %self.key.1, "origin fetch abandoned");
            self.coalescer.finish(&self.key, self.id, None, &slot);
        }
    }
}

pub(super) struct Subscription<T> {
    rx: watch::Receiver<Option<Shared<T>>>,
}

impl<T> Subscription<T> {
    /// Waits for the published result. Dropping the future only drops this receiver.
    pub(super) async fn wait(mut self) -> Shared<T> {
        let published = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        published.unwrap_or(Err(CacheError::FetchAbandoned))
    }
}

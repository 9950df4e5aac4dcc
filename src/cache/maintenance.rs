use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::store::VariantStore;

/// Periodically prunes expired entries. The task ends once the store is dropped.
pub(super) fn spawn_cache_sweeper(
    store: Weak<VariantStore>,
    interval: Duration,
    batch_size: usize,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() || batch_size == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                debug!("cache store dropped; stopping sweeper");
                break;
            };
            let stats = store.prune_expired(batch_size);
            trace!(
                inspected = stats.inspected,
                removed = stats.removed,
                "cache sweep finished"
            );
            crate::metrics::record_cache_sweep_run();
            crate::metrics::record_cache_sweep_removed(stats.removed, stats.bytes_reclaimed);
        }
    }))
}

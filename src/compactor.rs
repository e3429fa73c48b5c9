use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::LibraryStore;

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<LibraryStore>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Compact if at least `threshold` events were appended since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_due(store: &LibraryStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends == 0 || appends < threshold {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}

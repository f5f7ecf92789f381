use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that reclaims expired holds and expires lapsed purchase
/// orders on the engine's sweep interval.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let period = Duration::from_millis(engine.config().sweep_interval_ms.max(1) as u64);
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match engine.sweep().await {
            Ok(report) => {
                if report.holds_expired > 0 {
                    info!(count = report.holds_expired, "swept expired holds");
                }
                for po_id in &report.purchase_orders_expired {
                    info!(%po_id, "purchase order expired");
                }
            }
            Err(e) => warn!("sweep failed: {e}"),
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.appends_since_compact().await;
        if appends < threshold {
            debug!("compactor skip: {appends} appends");
            continue;
        }
        match engine.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("compaction failed: {e}"),
        }
    }
}

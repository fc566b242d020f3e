use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::info;

use crate::engine::MatchmakingEngine;

/// Background worker for matchmaking hygiene.
/// Purges active searches older than ten minutes and drops expired queue
/// entries across every round.
pub async fn run_cleanup_worker(engine: Arc<MatchmakingEngine>) {
    let mut ticker = interval(Duration::from_secs(300)); // Run every 5 minutes

    info!("Starting matchmaking cleanup worker (runs every 5 minutes)");

    loop {
        ticker.tick().await;

        let (stale_searches, expired_entries) = engine.run_cleanup().await;
        if stale_searches > 0 || expired_entries > 0 {
            info!(
                stale_searches,
                expired_entries, "Matchmaking cleanup removed stale state"
            );
        } else {
            info!("Matchmaking cleanup found nothing to remove");
        }
    }
}

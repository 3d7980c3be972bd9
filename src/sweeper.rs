use crate::orchestrator::IncidentOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Runs the inactivity sweep every `interval` until the task is dropped.
/// A failed sweep is logged and retried on the next tick.
pub async fn run_sweeper(orchestrator: Arc<IncidentOrchestrator>, interval: Duration) {
    info!("Starting incident sweeper every {}s", interval.as_secs());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match orchestrator.resolve_inactive_incidents().await {
            Ok(0) => {}
            Ok(resolved) => info!("Sweep closed {} inactive incidents", resolved),
            Err(e) => error!("Incident sweep failed: {}", e),
        }
    }
}

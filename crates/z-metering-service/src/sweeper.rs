//! Periodic release of stranded reservations.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use z_metering_engine::MeteringEngine;

/// Run [`MeteringEngine::sweep_stale_reservations`] every `period`.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_sweeper(engine: Arc<MeteringEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match engine.sweep_stale_reservations(engine.now()) {
                Ok(report) if report.released > 0 || report.failed > 0 => {
                    tracing::info!(
                        released = report.released,
                        credits_returned = report.credits_returned,
                        credits_stranded = report.credits_stranded,
                        failed = report.failed,
                        "Swept stale reservations"
                    );
                }
                Ok(_) => tracing::debug!("No stale reservations"),
                Err(e) => tracing::error!(error = %e, "Stale reservation sweep failed"),
            }
        }
    })
}

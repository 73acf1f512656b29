//! Background session expiry

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;

/// Periodically drop expired sessions until `shutdown` is cancelled
///
/// The first sweep happens one full `period` after spawning.
pub fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(period_secs = period.as_secs(), "Session sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Session sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    let removed = registry.sweep(registry.now());
                    if removed > 0 {
                        tracing::info!(
                            removed,
                            remaining = registry.session_count(),
                            "Expired sessions removed"
                        );
                    }
                }
            }
        }
    })
}

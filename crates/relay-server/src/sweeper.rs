use std::sync::Arc;
use std::time::Duration;

use relay_engine::Relay;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Background purge of expired notification rows. Reads already hide them;
/// this only reclaims space.
pub fn start_sweeper(
    relay: Arc<Relay>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = relay.purge_expired() {
                        tracing::warn!(error_kind = error.error_kind(), %error, "expiry sweep failed");
                    }
                }
            }
        }
        tracing::debug!("expiry sweeper stopped");
    })
}

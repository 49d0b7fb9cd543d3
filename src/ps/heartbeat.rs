//! PS -> master heartbeat worker.
//!
//! A single loop reports every hosted partition to the master on a jittered
//! interval. Admin events trigger an immediate beat so the master observes
//! lifecycle changes without waiting out the interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::server::PsServer;

/// Add +/- 15% jitter to a base interval, so a zone of partition servers
/// restarted together does not heartbeat in lockstep.
pub(super) fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

/// Spawn the heartbeat loop. It exits on the server's shutdown signal.
pub(super) fn spawn_heartbeat_loop(
    server: Arc<PsServer>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let interval = server.config().heartbeat_interval;

    tokio::spawn(async move {
        info!(node = %server.node_id(), interval_ms = interval.as_millis(), "heartbeat loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(with_jitter(interval)) => {}
                _ = server.heartbeat_triggered() => {
                    debug!(node = %server.node_id(), "heartbeat triggered");
                }
                _ = shutdown_rx.recv() => {
                    info!(node = %server.node_id(), "heartbeat loop received shutdown signal");
                    break;
                }
            }

            server.send_heartbeat().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_band() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = with_jitter(base);
            assert!(jittered >= Duration::from_secs_f64(8.5));
            assert!(jittered <= Duration::from_secs_f64(11.5));
        }
    }
}

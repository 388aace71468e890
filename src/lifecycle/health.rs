//! Periodic background task driving health checks.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run `tick` every `interval` until `shutdown` is cancelled. Missed ticks are skipped,
/// so a slow round never queues up a burst of checks.
pub fn spawn_monitor<F, Fut>(interval: Duration, shutdown: CancellationToken, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        timer.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    debug!("health round");
                    tick().await;
                }
            }
        }
        info!("health monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let c = count.clone();
        let handle = spawn_monitor(Duration::from_millis(20), shutdown.clone(), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(110)).await;
        shutdown.cancel();
        handle.await.unwrap();
        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 2, "ticked {} times", ticks);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }
}

//! Background cooldown decay
//!
//! One long-lived task per pool. Every tick it runs a full sweep under the
//! pool's write lock. The task holds only a weak reference: it stops when
//! the pool shuts down or when the last `Arc<KeyPool>` is dropped.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::pool::KeyPool;

/// Spawn the decay task for `pool`.
///
/// The ticker is created before spawning, so tick boundaries line up with
/// pool construction rather than with the first time the task is polled.
pub(crate) fn spawn_decay_task(
    pool: Weak<KeyPool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut ticker = tokio::time::interval(interval);

    tokio::spawn(async move {
        // Skip the immediate first tick, keys start ready
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                _ = ticker.tick() => {}
            }

            let Some(pool) = pool.upgrade() else {
                break;
            };
            pool.decay_once().await;
        }
        debug!("decay task stopped");
    })
}

//! Periodic sync of a device.
//!
//! [`SyncScheduler`] runs [`Syncable::sync`] right away and then once per
//! interval. Each tick runs as its own task so a slow sync never delays the
//! timer; the device itself turns overlapping ticks into skips. Errors are
//! logged and the loop carries on.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fan::SyncOutcome;
use crate::traits::Syncable;

/// Default time between syncs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Background task syncing one device on a fixed interval.
pub struct SyncScheduler {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_tick(device: Arc<dyn Syncable>) {
    match device.sync().await {
        Ok(SyncOutcome::Skipped) => debug!(device = device.name(), "Previous sync still running"),
        Ok(SyncOutcome::Completed(_)) => debug!(device = device.name(), "Sync completed"),
        Err(e) => warn!(device = device.name(), error = %e, "Sync failed"),
    }
}

impl SyncScheduler {
    /// Start syncing `device` every `period`.
    pub fn start(device: Arc<dyn Syncable>, period: Duration) -> Self {
        Self::with_cancel_token(device, period, CancellationToken::new())
    }

    /// Start syncing `device`, stopping when `cancel_token` is cancelled.
    pub fn with_cancel_token(
        device: Arc<dyn Syncable>,
        period: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        let task_token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut running = JoinSet::new();

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!(device = device.name(), "Sync scheduler cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        running.spawn(run_tick(device.clone()));
                    }
                    Some(joined) = running.join_next(), if !running.is_empty() => {
                        if let Err(e) = joined {
                            warn!(device = device.name(), error = %e, "Sync task panicked");
                        }
                    }
                }
            }

            // Let in-flight syncs finish; they observe the closed connection.
            while running.join_next().await.is_some() {}
        });

        Self {
            handle,
            cancel_token,
        }
    }

    /// Token that stops this scheduler when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop ticking without waiting.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Stop ticking and wait for in-flight syncs.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Sync scheduler task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::error::{Error, Result};
    use crate::fan::SyncSnapshot;

    #[derive(Default)]
    struct CountingSync {
        busy: AtomicBool,
        started: AtomicU32,
        skipped: AtomicU32,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Syncable for CountingSync {
        fn name(&self) -> &str {
            "counting"
        }

        async fn sync(&self) -> Result<SyncOutcome> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.skipped.fetch_add(1, Ordering::SeqCst);
                return Ok(SyncOutcome::Skipped);
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.busy.store(false, Ordering::SeqCst);
            if self.fail {
                return Err(Error::NotConnected);
            }
            Ok(SyncOutcome::Completed(SyncSnapshot {
                state: Default::default(),
                speed: Default::default(),
                boost: None,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_every_interval() {
        let device = Arc::new(CountingSync::default());
        let scheduler = SyncScheduler::start(device.clone(), DEFAULT_SYNC_INTERVAL);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(device.started.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(94)).await;
        assert_eq!(device.started.load(Ordering::SeqCst), 4);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_the_loop() {
        let device = Arc::new(CountingSync {
            fail: true,
            ..Default::default()
        });
        let scheduler = SyncScheduler::start(device.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(device.started.load(Ordering::SeqCst), 4);
        assert!(scheduler.is_running());
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sync_turns_ticks_into_skips() {
        let device = Arc::new(CountingSync {
            delay: Duration::from_secs(45),
            ..Default::default()
        });
        let scheduler = SyncScheduler::start(device.clone(), DEFAULT_SYNC_INTERVAL);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(device.started.load(Ordering::SeqCst), 2);
        assert_eq!(device.skipped.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticking() {
        let device = Arc::new(CountingSync::default());
        let token = CancellationToken::new();
        let scheduler =
            SyncScheduler::with_cancel_token(device.clone(), Duration::from_secs(10), token.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(device.started.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running());
    }
}

//! Background sync of every configured fan.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use calima_core::{
    DeviceEvent, Discovery, EventDispatcher, EventReceiver, FanDevice, SharedFan, SyncScheduler,
};

use crate::config::Config;
use crate::state::Board;
use crate::store::ConfigStore;

/// Failures logged as warnings before a device's errors go quiet.
const LOUD_FAILURES: u32 = 3;

/// Builds one [`FanDevice`] per configured fan and keeps them synced.
pub struct Collector {
    discovery: Arc<dyn Discovery>,
    board: Arc<Board>,
    store: ConfigStore,
    events: EventDispatcher,
}

impl Collector {
    /// Create a new collector.
    pub fn new(discovery: Arc<dyn Discovery>, board: Arc<Board>, store: ConfigStore) -> Self {
        Self {
            discovery,
            board,
            store,
            events: EventDispatcher::default(),
        }
    }

    /// Events from every device this collector built.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Build a device for every entry in `config`.
    pub async fn build_devices(&self, config: &Config) -> Vec<SharedFan> {
        let policy = config.connection.policy();
        let mut devices = Vec::with_capacity(config.devices.len());
        for record in config.records() {
            let sink = self
                .board
                .register(&record.name, &record.identity.address)
                .await;
            devices.push(Arc::new(FanDevice::with_events(
                record,
                Arc::clone(&self.discovery),
                policy.clone(),
                sink,
                Arc::new(self.store.clone()),
                self.events.clone(),
            )));
        }
        devices
    }

    /// Start syncing all configured devices.
    ///
    /// This spawns a scheduler per device plus one task that logs device
    /// events. Returns immediately; syncing happens in the background.
    pub async fn start(&self, config: &Config) -> Running {
        let cancel = CancellationToken::new();
        let logger = tokio::spawn(log_events(self.subscribe(), cancel.clone()));

        let devices = self.build_devices(config).await;
        if devices.is_empty() {
            info!("No devices configured for sync");
        } else {
            info!(
                "Starting sync for {} device(s) every {}s",
                devices.len(),
                config.sync.interval_secs
            );
        }

        let schedulers = devices
            .iter()
            .map(|device| {
                SyncScheduler::with_cancel_token(
                    device.clone(),
                    config.sync.interval(),
                    cancel.child_token(),
                )
            })
            .collect();

        Running {
            devices,
            schedulers,
            logger,
            cancel,
        }
    }

    /// Sync every configured device once, concurrently, then disconnect.
    pub async fn sync_once(&self, config: &Config) -> Vec<SharedFan> {
        let devices = self.build_devices(config).await;
        let results = join_all(devices.iter().map(|device| device.sync())).await;
        for (device, result) in devices.iter().zip(results) {
            if let Err(e) = result {
                warn!(device = device.name(), error = %e, "Sync failed");
            }
        }
        join_all(devices.iter().map(|device| device.close())).await;
        devices
    }
}

/// Handle to a started [`Collector`].
pub struct Running {
    devices: Vec<SharedFan>,
    schedulers: Vec<SyncScheduler>,
    logger: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Running {
    pub fn devices(&self) -> &[SharedFan] {
        &self.devices
    }

    /// Stop every scheduler, wait for in-flight syncs and close all links.
    pub async fn shutdown(self) {
        info!("Stopping sync for {} device(s)", self.devices.len());
        self.cancel.cancel();
        join_all(self.schedulers.into_iter().map(SyncScheduler::shutdown)).await;
        join_all(self.devices.iter().map(|device| device.close())).await;
        if let Err(e) = self.logger.await {
            debug!(error = %e, "Event logger ended abnormally");
        }
    }
}

/// Log device events until cancelled.
///
/// Errors are counted per device: the first few are warnings, then one
/// error is logged and later failures stay quiet until a sync succeeds.
async fn log_events(mut events: EventReceiver, cancel: CancellationToken) {
    let mut failures: HashMap<String, u32> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(DeviceEvent::Error { device, error }) => {
                let count = failures.entry(device.id.clone()).or_default();
                *count += 1;
                let name = device.name.as_deref().unwrap_or(&device.id);
                if *count <= LOUD_FAILURES {
                    warn!("{}: {} (failure {})", name, error, count);
                } else if *count == LOUD_FAILURES + 1 {
                    error!(
                        "{} failed {} times in a row, will continue trying silently",
                        name, count
                    );
                }
            }
            Ok(DeviceEvent::SyncCompleted { device }) => {
                if failures.remove(&device.id).is_some() {
                    info!("{} recovered", device.name.as_deref().unwrap_or(&device.id));
                }
            }
            Ok(DeviceEvent::Disconnected { device, reason }) => {
                debug!(device = %device.id, ?reason, "Disconnected");
            }
            Ok(DeviceEvent::ReconnectSucceeded { device, attempts }) => {
                info!(device = %device.id, attempts, "Reconnected");
            }
            Ok(event) => debug!(?event, "Device event"),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event logger lagged, skipped {} event(s)", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use calima_core::capability::Capability;
    use calima_core::mock::{MockDiscovery, MockFan};
    use calima_types::OperatingMode;

    use crate::config::DeviceConfig;

    fn config_for(fans: &[&MockFan]) -> Config {
        let mut config = Config::default();
        for (i, fan) in fans.iter().enumerate() {
            let identity = fan.identity();
            config.devices.push(DeviceConfig {
                name: format!("Fan {i}"),
                address: identity.address,
                id: Some(identity.id),
                pin: identity.pin,
                mode: Some(OperatingMode::HeatDistributionMode),
                first_run: true,
            });
        }
        config
    }

    fn collector(fans: Vec<Arc<MockFan>>, config: &Config) -> (Collector, Arc<Board>, ConfigStore) {
        let board = Board::new();
        let store = ConfigStore::in_memory(config.clone());
        let collector = Collector::new(
            Arc::new(MockDiscovery::new(fans)),
            Arc::clone(&board),
            store.clone(),
        );
        (collector, board, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_once_fills_board() {
        let first = Arc::new(MockFan::builder().address("58:2B:DB:00:00:01").build());
        let second = Arc::new(MockFan::builder().address("58:2B:DB:00:00:02").build());
        let config = config_for(&[&*first, &*second]);
        let (collector, board, store) = collector(vec![first.clone(), second.clone()], &config);

        collector.sync_once(&config).await;

        let devices = board.snapshot().await;
        assert_eq!(devices.len(), 2);
        for status in devices {
            assert!(status.availability.is_available(), "{status:?}");
            assert!(status.value(Capability::MeasureHumidity).is_some());
            assert_eq!(status.removed, vec!["boost".to_string()]);
        }
        assert!(store.config().await.devices.iter().all(|d| !d.first_run));
        assert!(!first.is_connected_now());
        assert!(!second.is_connected_now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_unreachable_device_does_not_block_others() {
        let good = Arc::new(MockFan::builder().address("58:2B:DB:00:00:01").build());
        let missing = MockFan::builder().address("58:2B:DB:00:00:02").build();
        let mut config = config_for(&[&*good, &missing]);
        config.connection.max_attempts = 1;
        let (collector, board, _) = collector(vec![good.clone()], &config);

        collector.sync_once(&config).await;

        let good_status = board.device("58:2B:DB:00:00:01").await.unwrap();
        assert!(good_status.availability.is_available());
        let missing_status = board.device("58:2B:DB:00:00:02").await.unwrap();
        assert!(!missing_status.availability.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_syncs_on_interval_until_shutdown() {
        let fan = Arc::new(MockFan::builder().build());
        let config = config_for(&[&*fan]);
        let (collector, board, _) = collector(vec![fan.clone()], &config);

        let running = collector.start(&config).await;
        assert_eq!(running.devices().len(), 1);
        tokio::time::sleep(Duration::from_secs(65)).await;
        running.shutdown().await;

        assert_eq!(fan.connect_count(), 3);
        assert!(!fan.is_connected_now());
        let status = board.device(&fan.identity().address).await.unwrap();
        assert!(status.availability.is_available());
    }
}

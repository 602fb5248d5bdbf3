//! btleplug-backed link to a fan.
//!
//! [`BleLink`] is the production [`Link`]: it connects a peripheral,
//! discovers its services once, and serves characteristic reads and writes
//! from a UUID-keyed cache, each bounded by a timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic as GattCharacteristic, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use calima_types::Characteristic;

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::traits::Link;
use crate::util::{create_identifier, format_peripheral_id};

/// Default timeout for BLE characteristic read operations.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for BLE characteristic write operations.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for BLE connection operations.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts for BLE operations on one link.
///
/// Increase them in challenging RF environments (concrete walls,
/// interference).
///
/// ```
/// use std::time::Duration;
/// use calima_core::device::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(20))
///     .read_timeout(Duration::from_secs(15));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a BLE connection.
    pub connection_timeout: Duration,
    /// Timeout for BLE read operations.
    pub read_timeout: Duration,
    /// Timeout for BLE write operations.
    pub write_timeout: Duration,
    /// Timeout for service discovery after connection.
    pub discovery_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Create a new connection config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }
}

/// An open BLE connection to one fan.
///
/// Call [`Link::disconnect`] before dropping; a dropped link that is still
/// open is disconnected best-effort in the background.
pub struct BleLink {
    /// Held so the peripheral's adapter outlives the connection.
    #[allow(dead_code)]
    adapter: Adapter,
    peripheral: Peripheral,
    address: String,
    /// Characteristics by UUID, built once after service discovery.
    characteristics: HashMap<Uuid, GattCharacteristic>,
    down: watch::Sender<bool>,
    watcher: JoinHandle<()>,
    disconnected: AtomicBool,
    config: ConnectionConfig,
}

impl std::fmt::Debug for BleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleLink")
            .field("address", &self.address)
            .field("characteristics", &self.characteristics.len())
            .field("disconnected", &self.disconnected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BleLink {
    /// Connect `peripheral` and discover its services.
    #[tracing::instrument(level = "info", skip_all, fields(connect_timeout = ?config.connection_timeout))]
    pub async fn connect(
        adapter: Adapter,
        peripheral: Peripheral,
        config: ConnectionConfig,
    ) -> Result<Self> {
        // Subscribe before connecting so an early drop is not missed.
        let mut events = adapter.events().await?;

        info!("Connecting to device...");
        timeout(config.connection_timeout, peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", config.connection_timeout))?
            .map_err(|e| {
                Error::connection_failed(
                    Some(format_peripheral_id(&peripheral.id())),
                    ConnectionFailureReason::from_ble(&e),
                )
            })?;
        info!("Connected!");

        timeout(config.discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", config.discovery_timeout))??;

        let mut characteristics = HashMap::new();
        for service in peripheral.services() {
            debug!("  Service: {}", service.uuid);
            for characteristic in service.characteristics {
                debug!("    Characteristic: {}", characteristic.uuid);
                characteristics.insert(characteristic.uuid, characteristic);
            }
        }
        debug!("Cached {} characteristics", characteristics.len());

        let properties = peripheral.properties().await?;
        let address = properties
            .as_ref()
            .map(|p| create_identifier(&p.address.to_string(), &peripheral.id()))
            .unwrap_or_else(|| format_peripheral_id(&peripheral.id()));

        let (down, _) = watch::channel(false);
        let notifier = down.clone();
        let peripheral_id = peripheral.id();
        let watched = address.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event
                    && id == peripheral_id
                {
                    debug!(device_address = %watched, "Adapter reported disconnect");
                    notifier.send_replace(true);
                    break;
                }
            }
        });

        Ok(Self {
            adapter,
            peripheral,
            address,
            characteristics,
            down,
            watcher,
            disconnected: AtomicBool::new(false),
            config,
        })
    }

    fn find_characteristic(&self, characteristic: Characteristic) -> Result<&GattCharacteristic> {
        self.characteristics
            .get(&characteristic.uuid())
            .ok_or_else(|| {
                Error::Transport(format!(
                    "characteristic {} ({}) not found among {} cached",
                    characteristic,
                    characteristic.uuid(),
                    self.characteristics.len()
                ))
            })
    }

    /// Timeouts this link was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl Link for BleLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>> {
        let gatt = self.find_characteristic(characteristic)?;
        let data = timeout(self.config.read_timeout, self.peripheral.read(gatt))
            .await
            .map_err(|_| Error::timeout(format!("read {characteristic}"), self.config.read_timeout))??;
        Ok(data)
    }

    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<()> {
        let gatt = self.find_characteristic(characteristic)?;
        timeout(
            self.config.write_timeout,
            self.peripheral.write(gatt, data, WriteType::WithResponse),
        )
        .await
        .map_err(|_| Error::timeout(format!("write {characteristic}"), self.config.write_timeout))??;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let down = self.disconnected.load(Ordering::SeqCst) || *self.down.borrow();
        !down && self.peripheral.is_connected().await.unwrap_or(false)
    }

    #[tracing::instrument(level = "info", skip(self), fields(device_address = %self.address))]
    async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from device...");
        self.disconnected.store(true, Ordering::SeqCst);
        self.watcher.abort();
        self.down.send_replace(true);
        self.peripheral.disconnect().await?;
        Ok(())
    }

    fn disconnect_notifier(&self) -> watch::Receiver<bool> {
        self.down.subscribe()
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.watcher.abort();
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.down.send_replace(true);

        warn!(
            device_address = %self.address,
            "BleLink dropped without calling disconnect() - performing best-effort cleanup"
        );

        let peripheral = self.peripheral.clone();
        let address = self.address.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(
                        device_address = %address,
                        error = %e,
                        "Best-effort disconnect failed (device may already be disconnected)"
                    );
                } else {
                    debug!(device_address = %address, "Best-effort disconnect completed");
                }
            });
        }
    }
}

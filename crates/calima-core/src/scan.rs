//! Device discovery and scanning.
//!
//! [`BleDiscovery`] is the production [`Discovery`]: it scans with the
//! first Bluetooth adapter, remembers the peripherals it saw, and opens
//! [`BleLink`]s to them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::advertisement::Advertisement;
use crate::device::{BleLink, ConnectionConfig};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::traits::{Discovery, Link};
use crate::util::{create_identifier, is_zero_address};

/// Options for scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long one scan listens for advertisements.
    pub duration: Duration,
    /// Scans made by `find` before giving up.
    pub find_attempts: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            find_attempts: 3,
        }
    }
}

impl ScanOptions {
    /// Create new scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan duration.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set scan duration in seconds.
    #[must_use]
    pub fn duration_secs(mut self, secs: u64) -> Self {
        self.duration = Duration::from_secs(secs);
        self
    }

    /// Set the number of scans `find` makes.
    #[must_use]
    pub fn find_attempts(mut self, attempts: u32) -> Self {
        self.find_attempts = attempts.max(1);
        self
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or(Error::ConnectionFailed {
        device_id: None,
        reason: ConnectionFailureReason::AdapterUnavailable,
    })
}

/// Build an advertisement from a peripheral's current properties.
async fn advertisement_for(peripheral: &Peripheral) -> Result<Option<Advertisement>> {
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };
    let address = properties.address.to_string();
    let id = create_identifier(&address, &peripheral.id());

    let mut adv = Advertisement::new(id, address);
    if let Some(name) = properties.local_name {
        adv = adv.with_local_name(name);
    }
    if let Some(rssi) = properties.rssi {
        adv = adv.with_rssi(rssi);
    }
    Ok(Some(adv))
}

/// Scan once with `adapter` and return everything seen.
pub async fn scan_with_adapter(
    adapter: &Adapter,
    options: &ScanOptions,
) -> Result<Vec<(Advertisement, Peripheral)>> {
    info!(
        "Starting BLE scan for {} seconds...",
        options.duration.as_secs()
    );

    adapter.start_scan(ScanFilter::default()).await?;
    sleep(options.duration).await;
    adapter.stop_scan().await?;

    let mut seen = Vec::new();
    for peripheral in adapter.peripherals().await? {
        match advertisement_for(&peripheral).await {
            Ok(Some(adv)) => seen.push((adv, peripheral)),
            Ok(None) => {}
            Err(e) => debug!("Error processing peripheral: {}", e),
        }
    }

    info!("Scan complete. Saw {} peripheral(s)", seen.len());
    Ok(seen)
}

/// Discovery over the platform's Bluetooth stack.
pub struct BleDiscovery {
    adapter: Adapter,
    options: ScanOptions,
    config: ConnectionConfig,
    /// Peripherals from earlier scans, by advertisement id.
    known: Mutex<HashMap<String, Peripheral>>,
}

impl std::fmt::Debug for BleDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleDiscovery")
            .field("options", &self.options)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BleDiscovery {
    /// Use the first Bluetooth adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(get_adapter().await?))
    }

    /// Use `adapter`.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            options: ScanOptions::default(),
            config: ConnectionConfig::default(),
            known: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_scan_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Timeouts for links opened by this backend.
    #[must_use]
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    fn remember(&self, seen: &[(Advertisement, Peripheral)]) {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        for (adv, peripheral) in seen {
            known.insert(adv.id.clone(), peripheral.clone());
        }
    }

    fn known_peripheral(&self, id: &str) -> Option<Peripheral> {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Look through peripherals the adapter already knows about.
    async fn find_known(&self, identifier: &str) -> Result<Option<Advertisement>> {
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(adv)) = advertisement_for(&peripheral).await
                && matches(&adv, identifier)
            {
                self.remember(&[(adv.clone(), peripheral)]);
                return Ok(Some(adv));
            }
        }
        Ok(None)
    }
}

fn matches(adv: &Advertisement, identifier: &str) -> bool {
    if adv.id.eq_ignore_ascii_case(identifier) {
        return true;
    }
    !is_zero_address(&adv.address)
        && adv.address.replace(':', "").eq_ignore_ascii_case(&identifier.replace(':', ""))
}

#[async_trait]
impl Discovery for BleDiscovery {
    async fn discover(&self, address_prefix: Option<&str>) -> Result<Vec<Advertisement>> {
        let seen = scan_with_adapter(&self.adapter, &self.options).await?;
        self.remember(&seen);
        Ok(seen
            .into_iter()
            .map(|(adv, _)| adv)
            .filter(|adv| address_prefix.is_none_or(|prefix| adv.has_prefix(prefix)))
            .collect())
    }

    async fn find(&self, identifier: &str) -> Result<Advertisement> {
        info!("Looking for device: {}", identifier);

        if let Some(adv) = self.find_known(identifier).await? {
            info!("Found device in cache (no scan needed)");
            return Ok(adv);
        }

        let attempts = self.options.find_attempts.max(1);
        for attempt in 1..=attempts {
            info!("Scan attempt {}/{}...", attempt, attempts);
            let seen = scan_with_adapter(&self.adapter, &self.options).await?;
            self.remember(&seen);
            if let Some((adv, _)) = seen.into_iter().find(|(adv, _)| matches(adv, identifier)) {
                info!("Found device on attempt {}", attempt);
                return Ok(adv);
            }
            if attempt < attempts {
                warn!("Device not found, retrying...");
            }
        }

        warn!("Device not found after {} attempts: {}", attempts, identifier);
        Err(Error::TransportUnavailable(format!(
            "device '{identifier}' not found"
        )))
    }

    async fn connect(&self, advertisement: &Advertisement) -> Result<Arc<dyn Link>> {
        let peripheral = match self.known_peripheral(&advertisement.id) {
            Some(peripheral) => peripheral,
            None => {
                self.find_known(&advertisement.id).await?;
                self.known_peripheral(&advertisement.id).ok_or_else(|| {
                    Error::TransportUnavailable(format!(
                        "device '{}' not found",
                        advertisement.id
                    ))
                })?
            }
        };

        let link =
            BleLink::connect(self.adapter.clone(), peripheral, self.config.clone()).await?;
        Ok(Arc::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_options_builder() {
        let options = ScanOptions::new().duration_secs(8).find_attempts(0);
        assert_eq!(options.duration, Duration::from_secs(8));
        assert_eq!(options.find_attempts, 1);
    }

    #[test]
    fn test_matches_ignores_separators() {
        let adv = Advertisement::new("58:2B:DB:00:00:01", "58:2B:DB:00:00:01");
        assert!(matches(&adv, "582bdb000001"));
        assert!(matches(&adv, "58:2b:db:00:00:01"));
        assert!(!matches(&adv, "58:2B:DB:00:00:02"));
    }

    #[test]
    fn test_zero_address_matches_by_id_only() {
        let adv = Advertisement::new("2F1C7A8E-0000-4000-8000-000000000001", "00:00:00:00:00:00");
        assert!(matches(&adv, "2f1c7a8e-0000-4000-8000-000000000001"));
        assert!(!matches(&adv, "00:00:00:00:00:00"));
    }
}

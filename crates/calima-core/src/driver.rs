//! Discovery of unpaired fans and the pairing flow.
//!
//! [`FanDriver::discover`] scans for PAX advertisements, connects to each
//! new one to read its name and operating mode, and caches the result in a
//! [`Registry`]. A [`PairingSession`] then runs discovery, walks the user
//! through picking a fan from the registry and entering its PIN, producing
//! the [`DeviceRecord`] the host persists.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use calima_types::{
    DeviceIdentity, DeviceRecord, DeviceSettings, OperatingMode, PAX_ADDRESS_PREFIX, Pin,
};

use crate::advertisement::Advertisement;
use crate::client::ProtocolClient;
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, DeviceId, EventDispatcher, EventReceiver};
use crate::traits::{Discovery, Pairable};

/// A discovered fan that is not paired yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub advertisement: Advertisement,
    /// Name read from the fan description.
    pub name: String,
    pub mode: OperatingMode,
}

impl Candidate {
    /// Record a host would store for this fan, without a PIN.
    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            name: self.name.clone(),
            identity: DeviceIdentity::new(
                &self.advertisement.address,
                &self.advertisement.id,
                None,
            ),
            settings: DeviceSettings {
                mode: Some(self.mode),
                first_run: true,
            },
        }
    }
}

/// Candidates found by discovery, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Candidate>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, candidate: Candidate) {
        let key = candidate.advertisement.address.to_uppercase();
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, candidate);
    }

    pub fn get(&self, address: &str) -> Option<Candidate> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address.to_uppercase())
            .cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    /// Remove a candidate once it has been paired.
    pub fn evict(&self, address: &str) -> Option<Candidate> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address.to_uppercase())
    }

    /// All candidates, ordered by address.
    pub fn list(&self) -> Vec<Candidate> {
        let mut candidates: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.advertisement.address.cmp(&b.advertisement.address));
        candidates
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Options for discovery runs.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Only advertisements whose address starts with this are considered.
    pub address_prefix: String,
    /// Bound on connecting to one candidate.
    pub connect_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            address_prefix: PAX_ADDRESS_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl DiscoveryOptions {
    #[must_use]
    pub fn address_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.address_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Finds and pairs fans.
#[derive(Clone)]
pub struct FanDriver {
    discovery: Arc<dyn Discovery>,
    registry: Registry,
    options: DiscoveryOptions,
    events: EventDispatcher,
}

impl std::fmt::Debug for FanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanDriver")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl FanDriver {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery,
            registry: Registry::new(),
            options: DiscoveryOptions::default(),
            events: EventDispatcher::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: DiscoveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Publish discovery events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Scan for new fans and resolve their name and mode.
    ///
    /// Advertisements already paired (in `known`) or already cached are
    /// skipped. Candidates are resolved concurrently; one that fails is
    /// logged and left out without affecting the others. Returns the
    /// candidates added by this run; a failed scan is logged and yields an
    /// empty run.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn discover(&self, known: &[DeviceIdentity]) -> Vec<Candidate> {
        let prefix = self.options.address_prefix.as_str();
        let advertisements = match self.discovery.discover(Some(prefix)).await {
            Ok(advertisements) => advertisements,
            Err(e) => {
                error!(error = %e, "Discovery failed");
                return Vec::new();
            }
        };

        let fresh: Vec<Advertisement> = advertisements
            .into_iter()
            .filter(|adv| adv.has_prefix(prefix))
            .filter(|adv| {
                !known
                    .iter()
                    .any(|k| k.matches(&adv.id) || k.matches(&adv.address))
            })
            .filter(|adv| !self.registry.contains(&adv.address))
            .collect();
        info!("Found {} new PAX device(s)", fresh.len());

        let results = join_all(fresh.into_iter().map(|adv| async move {
            let result = self.resolve(&adv).await;
            (adv, result)
        }))
        .await;

        let mut added = Vec::new();
        for (adv, result) in results {
            match result {
                Ok(candidate) => {
                    info!(address = %adv.address, name = %candidate.name, mode = %candidate.mode, "Resolved candidate");
                    self.events.send(DeviceEvent::Discovered {
                        device: DeviceId::with_name(adv.address.clone(), candidate.name.clone()),
                        rssi: adv.rssi,
                    });
                    self.registry.insert(candidate.clone());
                    added.push(candidate);
                }
                Err(e) => {
                    warn!(address = %adv.address, error = %e, "Skipping device that could not be read");
                }
            }
        }
        added
    }

    async fn resolve(&self, adv: &Advertisement) -> Result<Candidate> {
        let connect_timeout = self.options.connect_timeout;
        let link = timeout(connect_timeout, self.discovery.connect(adv))
            .await
            .map_err(|_| Error::timeout("connect", connect_timeout))??;

        let client = ProtocolClient::new(link.clone(), None);
        let result = client.get_name_and_mode().await;
        if let Err(e) = link.disconnect().await {
            debug!(address = %adv.address, error = %e, "Disconnect after discovery read failed");
        }

        let (name, mode) = result?;
        Ok(Candidate {
            advertisement: adv.clone(),
            name,
            mode,
        })
    }
}

impl Pairable for FanDriver {
    fn pair(&self, known: Vec<DeviceIdentity>) -> PairingSession {
        PairingSession::new(self.clone(), known)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairingStep {
    ListDevices,
    Selection,
    Pincode,
    Done,
    Finished,
}

/// One pairing conversation: list, select, enter PIN, done.
#[derive(Debug)]
pub struct PairingSession {
    driver: FanDriver,
    known: Vec<DeviceIdentity>,
    step: PairingStep,
    selected: Option<Candidate>,
    pin: Option<String>,
}

impl PairingSession {
    fn new(driver: FanDriver, known: Vec<DeviceIdentity>) -> Self {
        Self {
            driver,
            known,
            step: PairingStep::ListDevices,
            selected: None,
            pin: None,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.step == PairingStep::Finished {
            return Err(Error::Pairing("pairing session already finished".to_string()));
        }
        Ok(())
    }

    /// Run discovery, then list every candidate that is not paired yet.
    ///
    /// Candidates resolved by earlier runs are listed too. May be called
    /// again to refresh.
    pub async fn list_devices(&mut self) -> Result<Vec<DeviceRecord>> {
        self.ensure_open()?;
        self.driver.discover(&self.known).await;
        let records = self
            .driver
            .registry
            .list()
            .into_iter()
            .filter(|c| {
                !self
                    .known
                    .iter()
                    .any(|k| k.matches(&c.advertisement.address))
            })
            .map(|c| c.to_record())
            .collect();
        if self.step == PairingStep::ListDevices {
            self.step = PairingStep::Selection;
        }
        Ok(records)
    }

    /// Choose the device to pair by address.
    pub fn select(&mut self, address: &str) -> Result<DeviceRecord> {
        self.ensure_open()?;
        if self.step == PairingStep::ListDevices {
            return Err(Error::Pairing("list devices before selecting one".to_string()));
        }
        let candidate = self.driver.registry.get(address).ok_or_else(|| {
            Error::Pairing(format!("device {address} is no longer available"))
        })?;
        debug!(address, name = %candidate.name, "Selected device for pairing");
        let record = candidate.to_record();
        self.selected = Some(candidate);
        self.pin = None;
        self.step = PairingStep::Pincode;
        Ok(record)
    }

    /// Enter the PIN, one digit per element.
    pub fn pincode(&mut self, digits: &[String]) -> Result<()> {
        self.ensure_open()?;
        if self.selected.is_none() {
            return Err(Error::Pairing("select a device before entering the PIN".to_string()));
        }
        let pin: String = digits.concat();
        Pin::parse(&pin).map_err(Error::validation)?;
        self.pin = Some(pin);
        self.step = PairingStep::Done;
        Ok(())
    }

    /// Finish pairing and hand back the record to persist.
    ///
    /// The device leaves the discovery cache.
    pub fn done(&mut self) -> Result<DeviceRecord> {
        self.ensure_open()?;
        let (Some(candidate), Some(pin)) = (&self.selected, &self.pin) else {
            return Err(Error::Pairing("enter the PIN before finishing".to_string()));
        };

        let mut record = candidate.to_record();
        record.identity.pin = Some(pin.clone());
        self.driver.registry.evict(&candidate.advertisement.address);
        self.step = PairingStep::Finished;
        info!(address = %record.identity.address, name = %record.name, "Device paired");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDiscovery, MockFan};

    fn fan(address: &str, name: &str, mode: OperatingMode) -> Arc<MockFan> {
        Arc::new(MockFan::builder().address(address).name(name).mode(mode).build())
    }

    fn digits(pin: &str) -> Vec<String> {
        pin.chars().map(String::from).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_resolves_new_pax_devices() {
        let bathroom = fan("58:2B:DB:00:00:01", "Bathroom", OperatingMode::MultiMode);
        let kitchen = fan("58:2B:DB:00:00:02", "Kitchen", OperatingMode::HeatDistributionMode);
        let other = fan("AA:BB:CC:00:00:01", "Other", OperatingMode::MultiMode);
        let discovery = Arc::new(MockDiscovery::new(vec![bathroom.clone(), kitchen.clone(), other.clone()]));
        let driver = FanDriver::new(discovery);

        let mut added = driver.discover(&[bathroom.identity()]).await;
        assert_eq!(added.len(), 1);
        let candidate = added.remove(0);
        assert_eq!(candidate.name, "Kitchen");
        assert_eq!(candidate.mode, OperatingMode::HeatDistributionMode);

        assert_eq!(bathroom.connect_count(), 0);
        assert_eq!(other.connect_count(), 0);
        assert!(!kitchen.is_connected_now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_candidates_are_not_reconnected() {
        let kitchen = fan("58:2B:DB:00:00:02", "Kitchen", OperatingMode::MultiMode);
        let driver = FanDriver::new(Arc::new(MockDiscovery::new(vec![kitchen.clone()])));

        driver.discover(&[]).await;
        let added = driver.discover(&[]).await;

        assert!(added.is_empty());
        assert_eq!(kitchen.connect_count(), 1);
        assert_eq!(driver.registry().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_candidate_does_not_abort_discovery() {
        let broken = fan("58:2B:DB:00:00:01", "Broken", OperatingMode::MultiMode);
        broken.set_connect_failures(1);
        let slow = fan("58:2B:DB:00:00:02", "Slow", OperatingMode::MultiMode);
        slow.set_connect_latency(Duration::from_secs(60));
        let good = fan("58:2B:DB:00:00:03", "Good", OperatingMode::MultiMode);
        let discovery = Arc::new(MockDiscovery::new(vec![broken, slow, good]));
        let driver = FanDriver::new(discovery)
            .with_options(DiscoveryOptions::default().connect_timeout(Duration::from_secs(5)));

        let added = driver.discover(&[]).await;
        let names: Vec<_> = added.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Good"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_yields_empty_run() {
        let kitchen = fan("58:2B:DB:00:00:02", "Kitchen", OperatingMode::MultiMode);
        let discovery = Arc::new(MockDiscovery::new(vec![kitchen.clone()]));
        discovery.set_discover_failures(1);
        let driver = FanDriver::new(discovery);

        assert!(driver.discover(&[]).await.is_empty());
        assert!(driver.registry().is_empty());
        assert_eq!(kitchen.connect_count(), 0);

        let added = driver.discover(&[]).await;
        assert_eq!(added.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_flow() {
        let kitchen = fan("58:2B:DB:00:00:02", "Kitchen", OperatingMode::DraftShutterMode);
        let driver = FanDriver::new(Arc::new(MockDiscovery::new(vec![kitchen])));
        driver.discover(&[]).await;

        let mut session = driver.pair(vec![]);
        let listed = session.list_devices().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identity.address, "58:2B:DB:00:00:02");
        assert_eq!(listed[0].settings.mode, Some(OperatingMode::DraftShutterMode));
        assert!(listed[0].settings.first_run);

        session.select("58:2b:db:00:00:02").unwrap();
        session.pincode(&digits("0042")).unwrap();
        let record = session.done().unwrap();

        assert_eq!(record.name, "Kitchen");
        assert_eq!(record.identity.pin.as_deref(), Some("0042"));
        assert!(driver.registry().is_empty());
        assert!(session.list_devices().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_steps_out_of_order() {
        let kitchen = fan("58:2B:DB:00:00:02", "Kitchen", OperatingMode::MultiMode);
        let driver = FanDriver::new(Arc::new(MockDiscovery::new(vec![kitchen])));
        driver.discover(&[]).await;

        let mut session = driver.pair(vec![]);
        assert!(matches!(session.select("58:2B:DB:00:00:02"), Err(Error::Pairing(_))));
        assert!(matches!(session.pincode(&digits("1234")), Err(Error::Pairing(_))));
        assert!(matches!(session.done(), Err(Error::Pairing(_))));

        session.list_devices().await.unwrap();
        assert!(matches!(session.select("58:2B:DB:00:00:09"), Err(Error::Pairing(_))));
        session.select("58:2B:DB:00:00:02").unwrap();
        assert!(matches!(session.pincode(&digits("12a4")), Err(Error::Validation(_))));
        assert!(matches!(session.done(), Err(Error::Pairing(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_devices_runs_discovery() {
        let bathroom = fan("58:2B:DB:00:00:01", "Bathroom", OperatingMode::MultiMode);
        let kitchen = fan("58:2B:DB:00:00:02", "Kitchen", OperatingMode::MultiMode);
        let driver = FanDriver::new(Arc::new(MockDiscovery::new(vec![bathroom, kitchen])));
        assert!(driver.registry().is_empty());

        let mut session = driver.pair(vec![]);
        let listed = session.list_devices().await.unwrap();
        let addresses: Vec<_> = listed.iter().map(|r| r.identity.address.as_str()).collect();
        assert_eq!(addresses, vec!["58:2B:DB:00:00:01", "58:2B:DB:00:00:02"]);
        assert_eq!(driver.registry().len(), 2);

        session.select("58:2B:DB:00:00:02").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_devices_hides_known() {
        let kitchen = fan("58:2B:DB:00:00:02", "Kitchen", OperatingMode::MultiMode);
        let identity = kitchen.identity();
        let driver = FanDriver::new(Arc::new(MockDiscovery::new(vec![kitchen])));
        driver.discover(&[]).await;

        let mut session = driver.pair(vec![identity]);
        assert!(session.list_devices().await.unwrap().is_empty());
    }
}

//! In-process fan and discovery backend for testing.
//!
//! [`MockFan`] implements [`Link`] with the fan's characteristic layout and
//! PIN rules, so the protocol client, connection manager and sync logic can
//! be exercised without BLE hardware. [`MockDiscovery`] hands out links to a
//! set of mock fans.
//!
//! # Features
//!
//! - **Failure injection**: fail reads and writes, or the next N connects
//! - **Latency simulation**: delay reads, writes and connects
//! - **Call log**: every transport call is recorded as a [`MockCall`]
//!
//! [`MemorySink`] and [`MemoryStore`] stand in for the host side.
//!
//! ```
//! use std::sync::Arc;
//! use calima_core::mock::{MockDiscovery, MockFan};
//! use calima_core::{ConnectionManager, ReconnectPolicy};
//!
//! #[tokio::main]
//! async fn main() {
//!     let fan = Arc::new(MockFan::builder().name("Bathroom").build());
//!     let discovery = Arc::new(MockDiscovery::new(vec![fan.clone()]));
//!     let manager = ConnectionManager::new("Bathroom", fan.identity(), discovery, ReconnectPolicy::default());
//!
//!     let lease = manager.lease().await.unwrap();
//!     let state = lease.get_status().await.unwrap();
//!     println!("{state}");
//!     lease.release().await.unwrap();
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use calima_types::{
    BoostMode, Characteristic, DeviceIdentity, DeviceSettings, FanSpeed, OperatingMode, Pin,
    SensorData,
};

use crate::advertisement::Advertisement;
use crate::capability::{Availability, Capability, CapabilityValue};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::traits::{CapabilitySink, DeviceStore, Discovery, Link};

/// Trigger byte the fan reports while boost runs.
const BOOST_TRIGGER: u8 = 0x10;

/// A transport call made against a [`MockFan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect,
    Read(Characteristic),
    Write(Characteristic, Vec<u8>),
    Disconnect,
}

#[derive(Debug, Clone)]
struct FanRegisters {
    name: Vec<u8>,
    mode: u8,
    sensor: SensorData,
    speed: FanSpeed,
    boost: BoostMode,
    /// Trigger byte to restore once boost stops.
    idle_trigger: u8,
}

/// A mock PAX Calima fan.
pub struct MockFan {
    address: String,
    id: String,
    pin: Option<String>,
    registers: Mutex<FanRegisters>,
    connected: AtomicBool,
    authenticated: AtomicBool,
    disconnected: watch::Sender<bool>,
    calls: Mutex<Vec<MockCall>>,
    should_fail: AtomicBool,
    /// Simulated read/write latency in milliseconds (0 = no delay).
    op_latency_ms: AtomicU64,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    /// Number of connects to reject before succeeding.
    remaining_connect_failures: AtomicU32,
    connect_count: AtomicU32,
}

impl std::fmt::Debug for MockFan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFan")
            .field("address", &self.address)
            .field("id", &self.id)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockFan {
    /// Create a builder with default values.
    pub fn builder() -> MockFanBuilder {
        MockFanBuilder::new()
    }

    /// Identity a host would have stored after pairing this fan.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.address, &self.id, self.pin.clone())
    }

    /// Advertisement the fan broadcasts.
    pub fn advertisement(&self) -> Advertisement {
        let mut adv = Advertisement::new(&self.id, &self.address).with_rssi(-60);
        if let Ok(name) = std::str::from_utf8(&lock(&self.registers).name) {
            adv = adv.with_local_name(name.trim_end_matches('\0'));
        }
        adv
    }

    /// Open the link as a transport would, honouring injected latency and failures.
    pub async fn connect(&self) -> Result<()> {
        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.record(MockCall::Connect);

        let remaining = self.remaining_connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::OutOfRange,
            ));
        }

        self.force_connected();
        Ok(())
    }

    /// Mark the link up without going through [`connect`](Self::connect).
    pub fn force_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        self.disconnected.send_replace(false);
    }

    /// Drop the link as if the fan went out of range.
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        self.disconnected.send_replace(true);
    }

    /// Link state without going through the trait.
    pub fn is_connected_now(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current channel speeds.
    pub fn fan_speed(&self) -> FanSpeed {
        lock(&self.registers).speed
    }

    /// Current boost register.
    pub fn boost(&self) -> BoostMode {
        lock(&self.registers).boost
    }

    /// Current raw sensor register.
    pub fn sensor(&self) -> SensorData {
        lock(&self.registers).sensor
    }

    /// Replace the sensor register.
    pub fn set_sensor(&self, sensor: SensorData) {
        let mut registers = lock(&self.registers);
        registers.idle_trigger = sensor.trigger;
        registers.sensor = sensor;
    }

    /// Set the operating mode register.
    pub fn set_mode(&self, mode: OperatingMode) {
        lock(&self.registers).mode = mode.index();
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Number of connect attempts, including rejected ones.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Make every read and write fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Reject the next `count` connects.
    pub fn set_connect_failures(&self, count: u32) {
        self.remaining_connect_failures
            .store(count, Ordering::SeqCst);
    }

    /// Delay every read and write.
    pub fn set_op_latency(&self, latency: Duration) {
        self.op_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Delay every connect.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }

    async fn before_op(&self) -> Result<()> {
        let latency = self.op_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(Error::Transport("mock failure".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn check_pin(&self, data: &[u8]) -> Result<()> {
        let Some(expected) = &self.pin else {
            self.authenticated.store(true, Ordering::SeqCst);
            return Ok(());
        };
        let accepted = match (Pin::parse(expected), Pin::from_bytes(data)) {
            (Ok(expected), Ok(given)) => expected == given,
            _ => false,
        };
        self.authenticated.store(accepted, Ordering::SeqCst);
        if accepted {
            Ok(())
        } else {
            Err(Error::Transport("write rejected: wrong PIN".to_string()))
        }
    }

    fn apply_write(&self, characteristic: Characteristic, data: &[u8]) -> Result<()> {
        let mut registers = lock(&self.registers);
        match characteristic {
            Characteristic::LevelOfFanSpeed => {
                registers.speed = FanSpeed::from_bytes(data)?;
            }
            Characteristic::Boost => {
                let boost = BoostMode::from_bytes(data)?;
                registers.sensor.trigger = if boost.on {
                    BOOST_TRIGGER
                } else {
                    registers.idle_trigger
                };
                registers.boost = boost;
            }
            Characteristic::Mode => {
                registers.mode = OperatingMode::from_bytes(data)?.index();
            }
            Characteristic::FanDescription => registers.name = data.to_vec(),
            Characteristic::SensorData | Characteristic::PinCode => {
                return Err(Error::Transport(format!(
                    "characteristic {characteristic} is not writable"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Link for MockFan {
    fn address(&self) -> &str {
        &self.address
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>> {
        self.record(MockCall::Read(characteristic));
        self.before_op().await?;

        let registers = lock(&self.registers);
        let data = match characteristic {
            Characteristic::PinCode => vec![0; 4],
            Characteristic::FanDescription => registers.name.clone(),
            Characteristic::SensorData => registers.sensor.to_bytes(),
            Characteristic::Mode => vec![registers.mode],
            Characteristic::Boost => registers.boost.to_bytes(),
            Characteristic::LevelOfFanSpeed => registers.speed.to_bytes(),
        };
        Ok(data)
    }

    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<()> {
        self.record(MockCall::Write(characteristic, data.to_vec()));
        self.before_op().await?;

        if characteristic == Characteristic::PinCode {
            return self.check_pin(data);
        }
        if !self.authenticated.load(Ordering::SeqCst) {
            return Err(Error::Transport("write rejected: not authenticated".to_string()));
        }
        self.apply_write(characteristic, data)
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(MockCall::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        self.disconnected.send_replace(true);
        Ok(())
    }

    fn disconnect_notifier(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }
}

/// Builder for creating mock fans with custom settings.
#[derive(Debug, Clone)]
pub struct MockFanBuilder {
    address: String,
    id: Option<String>,
    name: Vec<u8>,
    mode: u8,
    sensor: SensorData,
    speed: FanSpeed,
    pin: Option<String>,
}

impl Default for MockFanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFanBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            address: "58:2B:DB:00:00:01".to_string(),
            id: None,
            name: b"PAX Calima".to_vec(),
            mode: OperatingMode::MultiMode.index(),
            sensor: SensorData {
                humidity_raw: 724,
                temperature_raw: 84,
                light: 12,
                rpm: 1000,
                trigger: 0x01,
                ..Default::default()
            },
            speed: FanSpeed::default(),
            pin: None,
        }
    }

    /// Set the MAC address.
    #[must_use]
    pub fn address(mut self, address: &str) -> Self {
        self.address = address.to_uppercase();
        self
    }

    /// Set the platform id (defaults to the address).
    #[must_use]
    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Set the fan description.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.as_bytes().to_vec();
        self
    }

    /// Set the fan description bytes verbatim.
    #[must_use]
    pub fn raw_name(mut self, name: Vec<u8>) -> Self {
        self.name = name;
        self
    }

    /// Set the operating mode.
    #[must_use]
    pub fn mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode.index();
        self
    }

    /// Set the raw humidity count.
    #[must_use]
    pub fn humidity_raw(mut self, raw: u16) -> Self {
        self.sensor.humidity_raw = raw;
        self
    }

    /// Set the raw temperature (quarter degrees).
    #[must_use]
    pub fn temperature_raw(mut self, raw: u16) -> Self {
        self.sensor.temperature_raw = raw;
        self
    }

    /// Set the light level.
    #[must_use]
    pub fn light(mut self, light: u16) -> Self {
        self.sensor.light = light;
        self
    }

    /// Set the current RPM.
    #[must_use]
    pub fn rpm(mut self, rpm: u16) -> Self {
        self.sensor.rpm = rpm;
        self
    }

    /// Set the raw trigger byte.
    #[must_use]
    pub fn trigger(mut self, trigger: u8) -> Self {
        self.sensor.trigger = trigger;
        self
    }

    /// Set the channel speeds.
    #[must_use]
    pub fn speed(mut self, speed: FanSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// Require `pin` before mutating writes.
    #[must_use]
    pub fn pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_string());
        self
    }

    /// Build the mock fan.
    pub fn build(self) -> MockFan {
        let (disconnected, _) = watch::channel(true);
        MockFan {
            id: self.id.unwrap_or_else(|| self.address.clone()),
            address: self.address,
            pin: self.pin,
            registers: Mutex::new(FanRegisters {
                name: self.name,
                mode: self.mode,
                idle_trigger: self.sensor.trigger,
                sensor: self.sensor,
                speed: self.speed,
                boost: BoostMode::off(),
            }),
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            disconnected,
            calls: Mutex::new(Vec::new()),
            should_fail: AtomicBool::new(false),
            op_latency_ms: AtomicU64::new(0),
            connect_latency_ms: AtomicU64::new(0),
            remaining_connect_failures: AtomicU32::new(0),
            connect_count: AtomicU32::new(0),
        }
    }
}

/// Discovery backend over a fixed set of mock fans.
#[derive(Debug, Default)]
pub struct MockDiscovery {
    fans: Mutex<Vec<Arc<MockFan>>>,
    /// Number of discovery runs to fail before succeeding.
    remaining_failures: AtomicU32,
    discover_count: AtomicU32,
}

impl MockDiscovery {
    /// Create a backend advertising `fans`.
    pub fn new(fans: Vec<Arc<MockFan>>) -> Self {
        Self {
            fans: Mutex::new(fans),
            ..Default::default()
        }
    }

    /// Start advertising another fan.
    pub fn add_fan(&self, fan: Arc<MockFan>) {
        lock(&self.fans).push(fan);
    }

    /// Fail the next `count` discovery runs.
    pub fn set_discover_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::SeqCst);
    }

    /// Number of discovery runs so far.
    pub fn discover_count(&self) -> u32 {
        self.discover_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn discover(&self, address_prefix: Option<&str>) -> Result<Vec<Advertisement>> {
        self.discover_count.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TransportUnavailable(
                "mock adapter unavailable".to_string(),
            ));
        }

        let fans = lock(&self.fans).clone();
        Ok(fans
            .iter()
            .map(|fan| fan.advertisement())
            .filter(|adv| address_prefix.is_none_or(|prefix| adv.has_prefix(prefix)))
            .collect())
    }

    async fn connect(&self, advertisement: &Advertisement) -> Result<Arc<dyn Link>> {
        let fan = lock(&self.fans)
            .iter()
            .find(|fan| fan.id == advertisement.id)
            .cloned()
            .ok_or_else(|| {
                Error::TransportUnavailable(format!(
                    "device '{}' not found",
                    advertisement.address
                ))
            })?;
        fan.connect().await?;
        Ok(fan as Arc<dyn Link>)
    }
}

/// Capability sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    values: Mutex<BTreeMap<Capability, CapabilityValue>>,
    removed: Mutex<BTreeSet<Capability>>,
    availability: Mutex<Availability>,
    /// Capabilities whose publish fails.
    failing: Mutex<BTreeSet<Capability>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value published for `capability`.
    pub fn value(&self, capability: Capability) -> Option<CapabilityValue> {
        lock(&self.values).get(&capability).cloned()
    }

    /// All published values.
    pub fn values(&self) -> BTreeMap<Capability, CapabilityValue> {
        lock(&self.values).clone()
    }

    /// Capabilities removed so far.
    pub fn removed(&self) -> Vec<Capability> {
        lock(&self.removed).iter().copied().collect()
    }

    pub fn availability(&self) -> Availability {
        lock(&self.availability).clone()
    }

    /// Make publishing `capability` fail.
    pub fn fail_on(&self, capability: Capability) {
        lock(&self.failing).insert(capability);
    }
}

#[async_trait]
impl CapabilitySink for MemorySink {
    async fn set_value(&self, capability: Capability, value: CapabilityValue) -> Result<()> {
        if lock(&self.failing).contains(&capability) {
            return Err(Error::Host(format!("cannot publish {capability}")));
        }
        lock(&self.values).insert(capability, value);
        Ok(())
    }

    async fn remove_capability(&self, capability: Capability) -> Result<()> {
        lock(&self.values).remove(&capability);
        lock(&self.removed).insert(capability);
        Ok(())
    }

    async fn set_available(&self) -> Result<()> {
        *lock(&self.availability) = Availability::Available;
        Ok(())
    }

    async fn set_unavailable(&self, reason: &str) -> Result<()> {
        *lock(&self.availability) = Availability::Unavailable(reason.to_string());
        Ok(())
    }
}

/// Device store that records every save.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saves: Mutex<Vec<(DeviceIdentity, DeviceSettings)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every save, oldest first.
    pub fn saves(&self) -> Vec<(DeviceIdentity, DeviceSettings)> {
        lock(&self.saves).clone()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn save_store(&self, identity: &DeviceIdentity, settings: &DeviceSettings) -> Result<()> {
        lock(&self.saves).push((identity.clone(), settings.clone()));
        Ok(())
    }
}

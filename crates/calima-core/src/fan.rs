//! One paired fan: sync, manual actions and first-run handling.
//!
//! A [`FanDevice`] pulls state through its [`ConnectionManager`] and pushes
//! it to a [`CapabilitySink`]. Sync and the manual actions share the
//! manager's FIFO lease, so they never interleave on the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use calima_types::{
    BoostMode, DeviceIdentity, DeviceRecord, DeviceSettings, FanChannel, FanSpeed, FanState,
    Trigger,
};

use crate::capability::{Capability, CapabilityValue};
use crate::connection::{ConnectionManager, LinkLease};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, DeviceId, EventDispatcher, EventReceiver};
use crate::reconnect::ReconnectPolicy;
use crate::traits::{CapabilitySink, DeviceStore, Discovery, FlowActionable, Syncable};

/// Boost duration used when a flow does not give one.
pub const DEFAULT_BOOST_SECONDS: u16 = 900;

/// State read during one sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub state: FanState,
    pub speed: FanSpeed,
    /// Not read for devices without boost.
    pub boost: Option<BoostMode>,
}

/// Result of [`FanDevice::sync`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Another sync was still running.
    Skipped,
    Completed(SyncSnapshot),
}

impl SyncOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::Skipped)
    }
}

/// Clears the in-progress flag when a sync ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A paired PAX Calima fan.
pub struct FanDevice {
    name: String,
    identity: DeviceIdentity,
    settings: Mutex<DeviceSettings>,
    connection: ConnectionManager,
    sink: Arc<dyn CapabilitySink>,
    store: Arc<dyn DeviceStore>,
    syncing: AtomicBool,
    events: EventDispatcher,
    last: Mutex<Option<SyncSnapshot>>,
}

impl std::fmt::Debug for FanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanDevice")
            .field("name", &self.name)
            .field("address", &self.identity.address)
            .field("settings", &*self.settings())
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl FanDevice {
    /// Create a device from its stored record.
    pub fn new(
        record: DeviceRecord,
        discovery: Arc<dyn Discovery>,
        policy: ReconnectPolicy,
        sink: Arc<dyn CapabilitySink>,
        store: Arc<dyn DeviceStore>,
    ) -> Self {
        Self::with_events(record, discovery, policy, sink, store, EventDispatcher::default())
    }

    /// Create a device that publishes events (its own and its connection's) to `events`.
    pub fn with_events(
        record: DeviceRecord,
        discovery: Arc<dyn Discovery>,
        policy: ReconnectPolicy,
        sink: Arc<dyn CapabilitySink>,
        store: Arc<dyn DeviceStore>,
        events: EventDispatcher,
    ) -> Self {
        let connection = ConnectionManager::with_events(
            record.name.clone(),
            record.identity.clone(),
            discovery,
            policy,
            events.clone(),
        );
        Self {
            name: record.name,
            identity: record.identity,
            settings: Mutex::new(record.settings),
            connection,
            sink,
            store,
            syncing: AtomicBool::new(false),
            events,
            last: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn settings(&self) -> MutexGuard<'_, DeviceSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current persisted settings.
    pub fn device_settings(&self) -> DeviceSettings {
        self.settings().clone()
    }

    /// The device's connection.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Snapshot from the last completed sync.
    pub fn last_snapshot(&self) -> Option<SyncSnapshot> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_snapshot(&self, update: impl FnOnce(&mut SyncSnapshot)) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(snapshot) = last.as_mut() {
            update(snapshot);
        }
    }

    fn device_id(&self) -> DeviceId {
        DeviceId::with_name(self.identity.address.clone(), self.name.clone())
    }

    /// Whether the trigger seen by the last sync has the label `label`.
    pub fn mode_equals(&self, label: &str) -> bool {
        self.last_snapshot()
            .is_some_and(|s| s.state.trigger.label() == label)
    }

    /// Whether boost was on at the last sync or after the last boost action.
    pub fn boost_is_on(&self) -> bool {
        self.last_snapshot().is_some_and(|s| {
            s.boost.is_some_and(|b| b.on) || s.state.trigger == Trigger::Boost
        })
    }

    /// Apply first-run adjustments once after pairing.
    ///
    /// Heat distribution fans lose the Boost capability. The cleared flag is
    /// persisted so this runs once per device.
    pub async fn initialize(&self) -> Result<()> {
        let settings = {
            let settings = self.settings();
            if !settings.first_run {
                return Ok(());
            }
            settings.clone()
        };

        if !settings.supports_boost() {
            info!(device = %self.name, "Mode has no boost, removing capability");
            self.sink.remove_capability(Capability::Boost).await?;
        }

        let updated = DeviceSettings {
            first_run: false,
            ..settings
        };
        self.store.save_store(&self.identity, &updated).await?;
        *self.settings() = updated;
        debug!(device = %self.name, "First run complete");
        Ok(())
    }

    async fn mark_unavailable(&self, error: &Error) {
        if let Err(e) = self.sink.set_unavailable(&error.to_string()).await {
            warn!(device = %self.name, error = %e, "Failed to mark device unavailable");
        }
        self.events.send(DeviceEvent::Error {
            device: self.device_id(),
            error: error.to_string(),
        });
    }

    async fn read_snapshot(&self, lease: &LinkLease, with_boost: bool) -> Result<SyncSnapshot> {
        let state = lease.get_status().await?;
        let speed = lease.get_fan_speed().await?;
        let boost = if with_boost {
            Some(lease.get_boost_mode().await?)
        } else {
            None
        };
        Ok(SyncSnapshot {
            state,
            speed,
            boost,
        })
    }

    async fn publish(&self, capability: Capability, value: impl Into<CapabilityValue>) {
        if let Err(e) = self.sink.set_value(capability, value.into()).await {
            warn!(device = %self.name, %capability, error = %e, "Failed to publish capability");
        }
    }

    async fn publish_snapshot(&self, snapshot: &SyncSnapshot) {
        let state = &snapshot.state;
        self.publish(Capability::MeasureTemperature, f64::from(state.temperature))
            .await;
        self.publish(Capability::MeasureHumidity, f64::from(state.humidity))
            .await;
        self.publish(Capability::MeasureLuminance, state.light).await;
        self.publish(Capability::MeasureRpm, state.rpm).await;
        self.publish(Capability::Mode, state.trigger.label().to_string())
            .await;
        if let Some(boost) = snapshot.boost {
            self.publish(Capability::Boost, boost.on).await;
        }
        for channel in FanChannel::ALL {
            self.publish(Capability::FanSpeed(channel), snapshot.speed.get(channel))
                .await;
        }
    }

    /// Pull all readable state and publish it.
    ///
    /// Returns [`SyncOutcome::Skipped`] without touching the link if the
    /// previous sync is still running. On failure the device is marked
    /// unavailable and the error returned; the next sync tries again.
    #[tracing::instrument(level = "debug", skip(self), fields(device = %self.name))]
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let Some(_guard) = SyncGuard::try_acquire(&self.syncing) else {
            debug!(device = %self.name, "Sync already running, skipping");
            self.events.send(DeviceEvent::SyncSkipped {
                device: self.device_id(),
            });
            return Ok(SyncOutcome::Skipped);
        };

        if let Err(e) = self.initialize().await {
            warn!(device = %self.name, error = %e, "First-run setup failed, retrying next sync");
        }
        let with_boost = self.settings().supports_boost();

        let lease = match self.connection.lease().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(device = %self.name, error = %e, "Sync could not connect");
                self.mark_unavailable(&e).await;
                return Err(e);
            }
        };

        let read = self.read_snapshot(&lease, with_boost).await;
        if let Err(e) = lease.release().await {
            debug!(device = %self.name, error = %e, "Release after sync failed");
        }

        let snapshot = match read {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(device = %self.name, error = %e, "Sync read failed");
                self.mark_unavailable(&e).await;
                return Err(e);
            }
        };

        info!(device = %self.name, "{}", snapshot.state);
        self.publish_snapshot(&snapshot).await;
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());

        if let Err(e) = self.sink.set_available().await {
            warn!(device = %self.name, error = %e, "Failed to mark device available");
        }
        self.events.send(DeviceEvent::SyncCompleted {
            device: self.device_id(),
        });
        Ok(SyncOutcome::Completed(snapshot))
    }

    /// Start or stop boost.
    ///
    /// Without a duration boost runs for [`DEFAULT_BOOST_SECONDS`]. The
    /// duration is truncated to whole seconds and must fit the fan's 16-bit
    /// timer.
    #[tracing::instrument(level = "info", skip(self), fields(device = %self.name))]
    pub async fn boost_on_off(&self, on: bool, duration: Option<Duration>) -> Result<()> {
        let supports_boost = self.settings().supports_boost();
        let seconds = boost_seconds(duration)?;
        if on && !supports_boost {
            return Err(Error::Validation(
                "boost is not available in heat distribution mode".to_string(),
            ));
        }
        self.require_pin()?;

        let lease = self.connection.lease().await?;
        let result = if on {
            lease.start_boost(seconds).await
        } else {
            lease.stop_boost().await
        };
        if let Err(e) = lease.release().await {
            debug!(device = %self.name, error = %e, "Release after boost failed");
        }
        result?;

        info!(device = %self.name, on, seconds, "Boost changed");
        let boost = if on {
            BoostMode::start(seconds)
        } else {
            BoostMode::off()
        };
        self.update_snapshot(|s| s.boost = Some(boost));
        if supports_boost {
            self.publish(Capability::Boost, on).await;
        }
        Ok(())
    }

    /// Change one channel's speed, keeping the other two as the fan reports them.
    #[tracing::instrument(level = "info", skip(self), fields(device = %self.name))]
    pub async fn set_fan_speed(&self, channel: FanChannel, rpm: u16) -> Result<()> {
        FanSpeed::validate_speed(channel, rpm).map_err(Error::validation)?;
        self.require_pin()?;

        let lease = self.connection.lease().await?;
        let result = async {
            let current = lease.get_fan_speed().await?;
            let updated = current.with_channel(channel, rpm);
            lease
                .set_fan_speed(updated.humidity, updated.light, updated.trickle)
                .await?;
            Ok::<_, Error>(updated)
        }
        .await;
        if let Err(e) = lease.release().await {
            debug!(device = %self.name, error = %e, "Release after speed change failed");
        }
        let updated = result?;

        info!(device = %self.name, channel = channel.as_str(), rpm, "Fan speed changed");
        self.update_snapshot(|s| s.speed = updated);
        self.publish(Capability::FanSpeed(channel), rpm).await;
        Ok(())
    }

    /// Shut the device's connection down for good.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Writes need a PIN; fail before touching the link when there is none.
    fn require_pin(&self) -> Result<()> {
        if self.identity.pin.is_none() {
            return Err(Error::auth_failed("no PIN configured for this device"));
        }
        Ok(())
    }
}

fn boost_seconds(duration: Option<Duration>) -> Result<u16> {
    let Some(duration) = duration else {
        return Ok(DEFAULT_BOOST_SECONDS);
    };
    match u16::try_from(duration.as_secs()) {
        Ok(0) => Err(Error::Validation(
            "boost duration must be at least one second".to_string(),
        )),
        Ok(seconds) => Ok(seconds),
        Err(_) => Err(Error::Validation(format!(
            "boost duration must be at most {} seconds",
            u16::MAX
        ))),
    }
}

#[async_trait]
impl Syncable for FanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sync(&self) -> Result<SyncOutcome> {
        FanDevice::sync(self).await
    }
}

#[async_trait]
impl FlowActionable for FanDevice {
    async fn boost_on_off(&self, on: bool, duration: Option<Duration>) -> Result<()> {
        FanDevice::boost_on_off(self, on, duration).await
    }

    async fn set_fan_speed(&self, channel: FanChannel, rpm: u16) -> Result<()> {
        FanDevice::set_fan_speed(self, channel, rpm).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Availability;
    use crate::mock::{MemorySink, MemoryStore, MockCall, MockDiscovery, MockFan};
    use calima_types::{Characteristic, OperatingMode};

    struct Harness {
        fan: Arc<MockFan>,
        sink: Arc<MemorySink>,
        store: Arc<MemoryStore>,
        device: Arc<FanDevice>,
    }

    fn harness(fan: MockFan, mode: OperatingMode) -> Harness {
        let fan = Arc::new(fan);
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(MemoryStore::new());
        let record = DeviceRecord {
            name: "Bathroom".to_string(),
            identity: fan.identity(),
            settings: DeviceSettings {
                mode: Some(mode),
                first_run: true,
            },
        };
        let device = Arc::new(FanDevice::new(
            record,
            Arc::new(MockDiscovery::new(vec![fan.clone()])),
            ReconnectPolicy::default().max_attempts(1),
            sink.clone(),
            store.clone(),
        ));
        Harness {
            fan,
            sink,
            store,
            device,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_publishes_every_capability() {
        let h = harness(
            MockFan::builder()
                .humidity_raw(1024)
                .temperature_raw(84)
                .light(12)
                .rpm(1100)
                .trigger(0x01)
                .build(),
            OperatingMode::MultiMode,
        );

        let outcome = h.device.sync().await.unwrap();
        assert!(!outcome.is_skipped());

        let values = h.sink.values();
        assert_eq!(values.len(), Capability::ALL.len());
        assert_eq!(
            h.sink.value(Capability::MeasureTemperature),
            Some(CapabilityValue::Number(21.0))
        );
        assert_eq!(
            h.sink.value(Capability::MeasureHumidity),
            Some(CapabilityValue::Number(100.0))
        );
        assert_eq!(
            h.sink.value(Capability::Mode),
            Some(CapabilityValue::Text("Trickle ventilation".into()))
        );
        assert_eq!(
            h.sink.value(Capability::Boost),
            Some(CapabilityValue::Bool(false))
        );
        assert_eq!(
            h.sink.value(Capability::FanSpeed(FanChannel::Trickle)),
            Some(CapabilityValue::Number(1000.0))
        );
        assert_eq!(h.sink.availability(), Availability::Available);
        assert!(!h.fan.is_connected_now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_without_boost() {
        let h = harness(MockFan::builder().build(), OperatingMode::HeatDistributionMode);

        h.device.sync().await.unwrap();

        assert_eq!(h.sink.removed(), vec![Capability::Boost]);
        assert_eq!(h.sink.value(Capability::Boost), None);
        assert!(!h.fan.calls().contains(&MockCall::Read(Characteristic::Boost)));

        let saves = h.store.saves();
        assert_eq!(saves.len(), 1);
        assert!(!saves[0].1.first_run);
        assert!(!h.device.device_settings().first_run);

        h.device.sync().await.unwrap();
        assert_eq!(h.store.saves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_with_boost_keeps_capability() {
        let h = harness(MockFan::builder().build(), OperatingMode::MultiMode);
        h.device.sync().await.unwrap();
        assert!(h.sink.removed().is_empty());
        assert_eq!(h.store.saves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sync_marks_unavailable() {
        let h = harness(MockFan::builder().build(), OperatingMode::MultiMode);
        h.fan.set_should_fail(true);

        assert!(h.device.sync().await.is_err());
        assert!(matches!(h.sink.availability(), Availability::Unavailable(_)));
        assert!(h.sink.values().is_empty());

        h.fan.set_should_fail(false);
        h.device.sync().await.unwrap();
        assert_eq!(h.sink.availability(), Availability::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_sync_is_skipped() {
        let h = harness(MockFan::builder().build(), OperatingMode::MultiMode);
        h.fan.set_op_latency(Duration::from_secs(2));

        let first = {
            let device = h.device.clone();
            tokio::spawn(async move { device.sync().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = h.device.sync().await.unwrap();
        assert!(second.is_skipped());
        assert!(!first.await.unwrap().unwrap().is_skipped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failed_publish_does_not_stop_the_rest() {
        let h = harness(MockFan::builder().build(), OperatingMode::MultiMode);
        h.sink.fail_on(Capability::MeasureHumidity);

        h.device.sync().await.unwrap();
        assert_eq!(h.sink.values().len(), Capability::ALL.len() - 1);
        assert_eq!(h.sink.availability(), Availability::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boost_defaults_to_900_seconds() {
        let h = harness(MockFan::builder().pin("1234").build(), OperatingMode::MultiMode);

        h.device.boost_on_off(true, None).await.unwrap();
        assert_eq!(h.fan.boost(), BoostMode::start(900));
        assert_eq!(
            h.sink.value(Capability::Boost),
            Some(CapabilityValue::Bool(true))
        );

        h.device.boost_on_off(false, None).await.unwrap();
        h.device.boost_on_off(false, None).await.unwrap();
        assert!(!h.fan.boost().on);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boost_duration_is_whole_seconds() {
        let h = harness(MockFan::builder().pin("1234").build(), OperatingMode::MultiMode);
        h.device
            .boost_on_off(true, Some(Duration::from_millis(60_500)))
            .await
            .unwrap();
        assert_eq!(h.fan.boost().seconds, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boost_duration_out_of_range() {
        let h = harness(MockFan::builder().pin("1234").build(), OperatingMode::MultiMode);
        for duration in [Duration::ZERO, Duration::from_secs(70_000)] {
            let err = h.device.boost_on_off(true, Some(duration)).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
        assert!(h.fan.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_boost_refused_in_heat_distribution_mode() {
        let h = harness(
            MockFan::builder().pin("1234").build(),
            OperatingMode::HeatDistributionMode,
        );
        let err = h.device.boost_on_off(true, None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(h.fan.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_fan_speed_keeps_other_channels() {
        let h = harness(
            MockFan::builder()
                .pin("1234")
                .speed(FanSpeed::new(2000, 1500, 1000))
                .build(),
            OperatingMode::MultiMode,
        );

        h.device
            .set_fan_speed(FanChannel::Trickle, 1200)
            .await
            .unwrap();
        assert_eq!(h.fan.fan_speed(), FanSpeed::new(2000, 1500, 1200));
        assert_eq!(
            h.sink.value(Capability::FanSpeed(FanChannel::Trickle)),
            Some(CapabilityValue::Number(1200.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_fan_speed_validates_before_connecting() {
        let h = harness(MockFan::builder().pin("1234").build(), OperatingMode::MultiMode);
        let err = h
            .device
            .set_fan_speed(FanChannel::Light, 1010)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(h.fan.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_without_pin_never_connect() {
        let h = harness(MockFan::builder().build(), OperatingMode::MultiMode);

        let err = h
            .device
            .set_fan_speed(FanChannel::Light, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed { .. }), "{err}");

        let err = h.device.boost_on_off(true, None).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed { .. }), "{err}");
        let err = h.device.boost_on_off(false, None).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed { .. }), "{err}");

        assert_eq!(h.fan.connect_count(), 0);
        assert!(h.fan.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conditions_follow_last_sync() {
        let h = harness(
            MockFan::builder().pin("1234").trigger(0x03).build(),
            OperatingMode::MultiMode,
        );
        assert!(!h.device.mode_equals("Humidity ventilation"));

        h.device.sync().await.unwrap();
        assert!(h.device.mode_equals("Humidity ventilation"));
        assert!(!h.device.boost_is_on());

        h.device.boost_on_off(true, None).await.unwrap();
        assert!(h.device.boost_is_on());

        h.device.sync().await.unwrap();
        assert!(h.device.mode_equals("Boost"));
    }
}

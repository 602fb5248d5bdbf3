//! Trait abstractions at the seams of the crate.
//!
//! Transports ([`Link`], [`Discovery`]) are implemented by the btleplug
//! backend and by the in-process [`mock`](crate::mock). Host interfaces
//! ([`CapabilitySink`], [`DeviceStore`]) are implemented by whatever embeds
//! the fans, such as `calima-service`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use calima_types::{Characteristic, DeviceIdentity, DeviceSettings, FanChannel};

use crate::advertisement::Advertisement;
use crate::capability::{Capability, CapabilityValue};
use crate::driver::PairingSession;
use crate::error::{Error, Result};
use crate::fan::SyncOutcome;

/// An open connection to one peripheral.
///
/// Characteristics are addressed by [`Characteristic`]; the transport maps
/// them to UUIDs.
#[async_trait]
pub trait Link: Send + Sync {
    /// Address or identifier of the connected peripheral.
    fn address(&self) -> &str;

    /// Read a characteristic value.
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>>;

    /// Write a characteristic value with response.
    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<()>;

    /// Check if the link is still up.
    async fn is_connected(&self) -> bool;

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;

    /// Watch that flips to `true` once the link goes down, for any reason.
    fn disconnect_notifier(&self) -> watch::Receiver<bool>;
}

/// Finding and connecting to peripherals.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Scan and return advertisements, optionally only those whose address
    /// starts with `address_prefix`.
    async fn discover(&self, address_prefix: Option<&str>) -> Result<Vec<Advertisement>>;

    /// Open a link to an advertised peripheral.
    async fn connect(&self, advertisement: &Advertisement) -> Result<Arc<dyn Link>>;

    /// Find one peripheral by id or address.
    async fn find(&self, identifier: &str) -> Result<Advertisement> {
        self.discover(None)
            .await?
            .into_iter()
            .find(|adv| adv.matches(identifier))
            .ok_or_else(|| Error::TransportUnavailable(format!("device '{identifier}' not found")))
    }
}

/// Where published device state goes.
#[async_trait]
pub trait CapabilitySink: Send + Sync {
    /// Publish one capability value.
    async fn set_value(&self, capability: Capability, value: CapabilityValue) -> Result<()>;

    /// Drop a capability the device does not support.
    async fn remove_capability(&self, capability: Capability) -> Result<()>;

    /// Mark the device reachable.
    async fn set_available(&self) -> Result<()>;

    /// Mark the device unreachable with a message for the user.
    async fn set_unavailable(&self, reason: &str) -> Result<()>;
}

/// Persistence for mutable per-device settings.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Persist `settings` for the device with `identity`.
    async fn save_store(&self, identity: &DeviceIdentity, settings: &DeviceSettings) -> Result<()>;
}

/// Something that can pull device state on a schedule.
#[async_trait]
pub trait Syncable: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run one sync.
    async fn sync(&self) -> Result<SyncOutcome>;
}

/// Manual operations exposed to automation flows.
#[async_trait]
pub trait FlowActionable: Send + Sync {
    /// Start (with an optional duration) or stop boost.
    async fn boost_on_off(&self, on: bool, duration: Option<Duration>) -> Result<()>;

    /// Change one ventilation channel, keeping the other two.
    async fn set_fan_speed(&self, channel: FanChannel, rpm: u16) -> Result<()>;
}

/// Entry point for adding new devices.
pub trait Pairable {
    /// Start a pairing session; `known` are the identities already paired.
    fn pair(&self, known: Vec<DeviceIdentity>) -> PairingSession;
}

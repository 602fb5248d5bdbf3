//! Capability board shared by the service's devices.
//!
//! The board is the service's stand-in for a home-automation host: every
//! [`FanDevice`](calima_core::FanDevice) publishes into its own
//! [`DeviceSink`], and `status` prints the board as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use calima_core::{Availability, Capability, CapabilitySink, CapabilityValue};

/// Published state of one device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceStatus {
    /// Device name.
    pub name: String,
    /// Device address.
    pub address: String,
    /// Last published value per capability name.
    pub values: BTreeMap<String, CapabilityValue>,
    /// Capabilities the device dropped.
    pub removed: Vec<String>,
    pub availability: Availability,
    /// Time of the last published value.
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl DeviceStatus {
    /// Value of `capability`, if published.
    pub fn value(&self, capability: Capability) -> Option<&CapabilityValue> {
        self.values.get(capability.name())
    }
}

/// Published state of every device, keyed by address.
#[derive(Debug, Default)]
pub struct Board {
    devices: RwLock<BTreeMap<String, DeviceStatus>>,
}

impl Board {
    /// Create an empty board.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a device and return the sink it publishes through.
    pub async fn register(self: &Arc<Self>, name: &str, address: &str) -> Arc<DeviceSink> {
        let address = address.to_uppercase();
        self.devices
            .write()
            .await
            .entry(address.clone())
            .or_insert_with(|| DeviceStatus {
                name: name.to_string(),
                address: address.clone(),
                ..Default::default()
            });
        Arc::new(DeviceSink {
            board: Arc::clone(self),
            address,
        })
    }

    /// Current state of one device.
    pub async fn device(&self, address: &str) -> Option<DeviceStatus> {
        self.devices
            .read()
            .await
            .get(&address.to_uppercase())
            .cloned()
    }

    /// Current state of every device, ordered by address.
    pub async fn snapshot(&self) -> Vec<DeviceStatus> {
        self.devices.read().await.values().cloned().collect()
    }

    async fn update(&self, address: &str, update: impl FnOnce(&mut DeviceStatus)) {
        if let Some(status) = self.devices.write().await.get_mut(address) {
            update(status);
        }
    }
}

/// [`CapabilitySink`] that writes one device's values to the [`Board`].
#[derive(Debug)]
pub struct DeviceSink {
    board: Arc<Board>,
    address: String,
}

impl DeviceSink {
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl CapabilitySink for DeviceSink {
    async fn set_value(
        &self,
        capability: Capability,
        value: CapabilityValue,
    ) -> calima_core::Result<()> {
        self.board
            .update(&self.address, |status| {
                status.values.insert(capability.name().to_string(), value);
                status.updated_at = Some(OffsetDateTime::now_utc());
            })
            .await;
        Ok(())
    }

    async fn remove_capability(&self, capability: Capability) -> calima_core::Result<()> {
        let name = capability.name().to_string();
        self.board
            .update(&self.address, |status| {
                status.values.remove(&name);
                if !status.removed.contains(&name) {
                    status.removed.push(name);
                }
            })
            .await;
        Ok(())
    }

    async fn set_available(&self) -> calima_core::Result<()> {
        self.board
            .update(&self.address, |status| {
                status.availability = Availability::Available;
            })
            .await;
        Ok(())
    }

    async fn set_unavailable(&self, reason: &str) -> calima_core::Result<()> {
        self.board
            .update(&self.address, |status| {
                status.availability = Availability::Unavailable(reason.to_string());
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calima_types::FanChannel;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let board = Board::new();
        board.register("Bathroom", "58:2b:db:01:02:03").await;
        board.register("Bathroom", "58:2B:DB:01:02:03").await;

        let devices = board.snapshot().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "58:2B:DB:01:02:03");
        assert_eq!(devices[0].availability, Availability::Unknown);
    }

    #[tokio::test]
    async fn test_sink_publishes_values() {
        let board = Board::new();
        let sink = board.register("Bathroom", "58:2B:DB:01:02:03").await;

        sink.set_value(Capability::MeasureHumidity, CapabilityValue::Number(55.0))
            .await
            .unwrap();
        sink.set_value(
            Capability::FanSpeed(FanChannel::Trickle),
            CapabilityValue::Number(1000.0),
        )
        .await
        .unwrap();
        sink.set_available().await.unwrap();

        let status = board.device("58:2b:db:01:02:03").await.unwrap();
        assert_eq!(
            status.value(Capability::MeasureHumidity),
            Some(&CapabilityValue::Number(55.0))
        );
        assert!(status.values.contains_key("fanspeed.trickle"));
        assert!(status.availability.is_available());
        assert!(status.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_remove_and_unavailable() {
        let board = Board::new();
        let sink = board.register("Bathroom", "58:2B:DB:01:02:03").await;

        sink.set_value(Capability::Boost, CapabilityValue::Bool(false))
            .await
            .unwrap();
        sink.remove_capability(Capability::Boost).await.unwrap();
        sink.remove_capability(Capability::Boost).await.unwrap();
        sink.set_unavailable("out of range").await.unwrap();

        let status = board.device("58:2B:DB:01:02:03").await.unwrap();
        assert_eq!(status.value(Capability::Boost), None);
        assert_eq!(status.removed, vec!["boost".to_string()]);
        assert_eq!(
            status.availability,
            Availability::Unavailable("out of range".to_string())
        );
    }

    #[tokio::test]
    async fn test_status_serialization() {
        let board = Board::new();
        let sink = board.register("Bathroom", "58:2B:DB:01:02:03").await;
        sink.set_value(Capability::Mode, CapabilityValue::Text("Boost".into()))
            .await
            .unwrap();

        let json = serde_json::to_value(board.snapshot().await).unwrap();
        assert_eq!(json[0]["name"], "Bathroom");
        assert_eq!(json[0]["values"]["mode"], "Boost");
        assert_eq!(json[0]["availability"]["state"], "unknown");
        assert!(json[0]["updated_at"].is_string());
    }
}

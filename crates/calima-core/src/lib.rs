//! Core BLE library for PAX Calima bathroom fans.
//!
//! This crate talks to Calima fans over Bluetooth Low Energy and keeps a
//! host's view of each fan up to date.
//!
//! # Features
//!
//! - **Device discovery**: Scan for PAX fans and read their name and mode
//! - **Pairing**: List, select and PIN-authenticate new fans
//! - **Sensor sync**: Humidity, temperature, light, RPM and trigger on a timer
//! - **Fan control**: Boost on/off and per-channel speeds
//! - **Connection management**: Single-owner links with backoff and
//!   background reconnection
//! - **Testing without hardware**: In-process [`mock`] fans
//!
//! # Layers
//!
//! | Layer | Types |
//! |-------|-------|
//! | Transport | [`Link`], [`Discovery`], [`BleLink`], [`BleDiscovery`] |
//! | Protocol | [`ProtocolClient`] |
//! | Connection | [`ConnectionManager`], [`LinkLease`], [`ReconnectPolicy`] |
//! | Device | [`FanDevice`], [`SyncScheduler`] |
//! | Pairing | [`FanDriver`], [`PairingSession`] |
//!
//! # Platform Differences
//!
//! On macOS peripherals are identified by a CoreBluetooth UUID and the MAC
//! address reads as all zeros; on Linux and Windows the MAC address is the
//! identifier. [`DeviceIdentity`] stores both, and lookups accept either.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use calima_core::{BleDiscovery, ConnectionManager, DeviceIdentity, ReconnectPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = Arc::new(BleDiscovery::new().await?);
//!     let identity = DeviceIdentity::new("58:2B:DB:01:02:03", "58:2B:DB:01:02:03", Some("1234".into()));
//!     let manager = ConnectionManager::new("Bathroom", identity, discovery, ReconnectPolicy::default());
//!
//!     let lease = manager.lease().await?;
//!     println!("{}", lease.get_status().await?);
//!     lease.start_boost(600).await?;
//!     lease.release().await?;
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```

pub mod advertisement;
pub mod capability;
pub mod client;
pub mod connection;
pub mod device;
pub mod driver;
pub mod error;
pub mod events;
pub mod fan;
pub mod mock;
pub mod reconnect;
pub mod scan;
pub mod sync;
pub mod traits;
pub mod util;

// Re-export types and uuid modules from calima-types
pub use calima_types::types;
pub use calima_types::uuid as uuids;

// Core exports
pub use advertisement::Advertisement;
pub use capability::{Availability, Capability, CapabilityValue};
pub use client::ProtocolClient;
pub use connection::{ConnectionManager, LinkLease, LinkPhase, LinkState};
pub use device::{BleLink, ConnectionConfig};
pub use driver::{Candidate, DiscoveryOptions, FanDriver, PairingSession, Registry};
pub use error::{ConnectionFailureReason, Error, Result};
pub use events::{DeviceEvent, DeviceId, DisconnectReason, EventDispatcher, EventReceiver, EventSender};
pub use fan::{DEFAULT_BOOST_SECONDS, FanDevice, SyncOutcome, SyncSnapshot};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use scan::{BleDiscovery, ScanOptions, get_adapter};
pub use sync::{DEFAULT_SYNC_INTERVAL, SyncScheduler};
pub use traits::{
    CapabilitySink, DeviceStore, Discovery, FlowActionable, Link, Pairable, Syncable,
};
pub use util::{create_identifier, format_peripheral_id};

/// Type alias for a shared fan.
pub type SharedFan = std::sync::Arc<FanDevice>;

// Re-export from calima-types
pub use calima_types::{
    BoostMode, Characteristic, DeviceIdentity, DeviceRecord, DeviceSettings, FanChannel,
    FanSpeed, FanState, OperatingMode, Pin, SensorData, Trigger,
};

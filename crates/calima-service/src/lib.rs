//! Headless sync service for PAX Calima fans.
//!
//! This crate provides a service that:
//! - Polls configured fans on a schedule and keeps a capability board current
//! - Persists first-run and mode changes back to its configuration file
//! - Discovers and pairs new fans
//! - Runs boost and fan speed actions from the command line
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/calima/service.toml`:
//!
//! ```toml
//! [sync]
//! interval_secs = 30
//!
//! [connection]
//! connect_timeout_secs = 15
//! first_retry_secs = 10
//! retry_secs = 30
//! max_attempts = 3
//!
//! [[devices]]
//! name = "Bathroom"
//! address = "58:2B:DB:01:02:03"
//! pin = "1234"
//! mode = "MultiMode"
//! ```

pub mod collector;
pub mod config;
pub mod state;
pub mod store;

pub use collector::{Collector, Running};
pub use config::{
    Config, ConfigError, ConnectionSettings, DeviceConfig, DiscoverySettings, SyncConfig,
    ValidationError, default_config_path,
};
pub use state::{Board, DeviceSink, DeviceStatus};
pub use store::ConfigStore;

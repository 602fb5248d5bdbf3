//! Hardware integration tests for calima-core
//!
//! These tests require a PAX Calima fan in range and should be run with:
//! ```
//! cargo test --package calima-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the fan via environment variables:
//! - `CALIMA_DEVICE`: address (or macOS peripheral UUID) of the fan
//! - `CALIMA_PIN`: the fan's four-digit PIN, needed by the write tests
//!
//! Example:
//! ```
//! CALIMA_DEVICE="58:2B:DB:01:02:03" CALIMA_PIN=1234 cargo test --package calima-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use calima_core::{
    BleDiscovery, ConnectionManager, DeviceIdentity, Discovery, FanDriver, ReconnectPolicy,
    ScanOptions,
};
use tokio::time::timeout;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Get the device identifier from the environment
fn get_device() -> Option<String> {
    env::var("CALIMA_DEVICE").ok().filter(|s| !s.is_empty())
}

fn get_pin() -> Option<String> {
    env::var("CALIMA_PIN").ok().filter(|s| !s.is_empty())
}

async fn discovery() -> Arc<BleDiscovery> {
    let discovery = BleDiscovery::new()
        .await
        .expect("no Bluetooth adapter")
        .with_scan_options(ScanOptions::new().duration_secs(10));
    Arc::new(discovery)
}

async fn manager(device: &str) -> ConnectionManager {
    let identity = DeviceIdentity::new(device, device, get_pin());
    ConnectionManager::new(
        "Hardware test",
        identity,
        discovery().await,
        ReconnectPolicy::default(),
    )
}

// =============================================================================
// Scan Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_for_pax_devices() {
    let discovery = discovery().await;
    let seen = timeout(BLE_TIMEOUT, discovery.discover(Some("58:2B:DB")))
        .await
        .expect("scan timed out")
        .expect("scan failed");

    println!("Found {} PAX device(s)", seen.len());
    for adv in &seen {
        println!(
            "  {} ({}) rssi {:?}",
            adv.local_name.as_deref().unwrap_or("Unknown"),
            adv.address,
            adv.rssi
        );
    }
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_driver_resolves_names() {
    let driver = FanDriver::new(discovery().await);
    let candidates = timeout(BLE_TIMEOUT, driver.discover(&[]))
        .await
        .expect("discovery timed out");

    for candidate in candidates {
        println!(
            "  {} at {} in {}",
            candidate.name, candidate.advertisement.address, candidate.mode
        );
    }
}

// =============================================================================
// Read Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_read_status_and_speed() {
    let Some(device) = get_device() else {
        println!("Skipping: set CALIMA_DEVICE");
        return;
    };
    let manager = manager(&device).await;

    let lease = timeout(BLE_TIMEOUT, manager.lease())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let status = lease.get_status().await.expect("status read failed");
    let speed = lease.get_fan_speed().await.expect("speed read failed");
    let (name, mode) = lease.get_name_and_mode().await.expect("name read failed");
    lease.release().await.expect("release failed");

    println!("{name} ({mode}): {status}");
    println!("Speeds: {speed}");
    assert!(status.humidity <= 100);

    manager.close().await;
}

// =============================================================================
// Write Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_boost_on_then_off() {
    let (Some(device), Some(_)) = (get_device(), get_pin()) else {
        println!("Skipping: set CALIMA_DEVICE and CALIMA_PIN");
        return;
    };
    let manager = manager(&device).await;

    let lease = timeout(BLE_TIMEOUT, manager.lease())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    lease.start_boost(30).await.expect("boost on failed");
    let boost = lease.get_boost_mode().await.expect("boost read failed");
    assert!(boost.on);
    lease.stop_boost().await.expect("boost off failed");
    lease.release().await.expect("release failed");

    manager.close().await;
}

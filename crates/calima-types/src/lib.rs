//! Platform-agnostic types for PAX Calima ventilation fans.
//!
//! This crate holds the value types exchanged with the fan and the
//! fixed-layout codec for each characteristic. It has no BLE dependency;
//! transports live in `calima-core`.
//!
//! # Features
//!
//! - Sensor, boost, fan speed and operating mode types
//! - Little-endian codec for every characteristic payload
//! - Characteristic UUID constants
//! - Pairing identity and persisted settings
//!
//! # Example
//!
//! ```
//! use calima_types::{FanState, SensorData, Trigger};
//!
//! let bytes = [0x00, 0x04, 0x50, 0x00, 0x32, 0x00, 0x88, 0x13, 0x10, 0, 0, 0];
//! let state = FanState::from(SensorData::from_bytes(&bytes).unwrap());
//! assert_eq!(state.humidity, 100);
//! assert_eq!(state.trigger, Trigger::Boost);
//! ```

pub mod codec;
pub mod error;
pub mod types;
pub mod uuid;

pub use codec::decode_name;
pub use error::{ParseError, ParseResult};
pub use types::{
    BOOST_SPEED_RPM, BoostMode, DeviceIdentity, DeviceRecord, DeviceSettings, FanChannel,
    FanSpeed, FanState, MAX_SPEED_RPM, MIN_SPEED_RPM, OperatingMode, Pin, SPEED_STEP_RPM,
    SensorData, Trigger,
};
pub use uuid as uuids;
pub use uuid::{Characteristic, PAX_ADDRESS_PREFIX};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decode_example() {
        // humidity_raw = 1024, temperature_raw = 80, light = 50, rpm = 5000, trigger = 0x10
        let bytes: [u8; 12] = [
            0x00, 0x04, // humidity_raw
            0x50, 0x00, // temperature_raw
            0x32, 0x00, // light
            0x88, 0x13, // rpm
            0x10, // trigger, boost bit set
            0x00, 0x00, // reserved
            0x00, // reserved
        ];

        let state = FanState::from(SensorData::from_bytes(&bytes).unwrap());
        assert_eq!(state.humidity, 100);
        assert!((state.temperature - 20.0).abs() < 0.01);
        assert_eq!(state.light, 50);
        assert_eq!(state.rpm, 5000);
        assert_eq!(state.trigger, Trigger::Boost);
        assert_eq!(state.trigger.to_string(), "Boost");
    }

    #[test]
    fn test_status_decode_short_payload() {
        let bytes = [0u8; 10];
        let err = SensorData::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("requires 12 bytes"));
    }

    #[test]
    fn test_fan_state_display() {
        let state = FanState {
            humidity: 55,
            temperature: 21.5,
            light: 3,
            rpm: 1200,
            trigger: Trigger::Trickle,
        };
        assert_eq!(
            state.to_string(),
            "Fan state: Humidity = 55, Temperature = 21.5, Light = 3, RPM = 1200, Mode = Trickle ventilation"
        );
    }

    #[cfg(feature = "serde")]
    mod serde_tests {
        use super::*;

        #[test]
        fn test_operating_mode_serializes_by_name() {
            let json = serde_json::to_string(&OperatingMode::HeatDistributionMode).unwrap();
            assert_eq!(json, "\"HeatDistributionMode\"");
            let parsed: OperatingMode = serde_json::from_str("\"MultiMode\"").unwrap();
            assert_eq!(parsed, OperatingMode::MultiMode);
        }

        #[test]
        fn test_unknown_operating_mode_round_trips() {
            let json = serde_json::to_string(&OperatingMode::Unknown(9)).unwrap();
            let parsed: OperatingMode = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, OperatingMode::Unknown(9));
        }

        #[test]
        fn test_device_settings_defaults_first_run() {
            let settings: DeviceSettings = serde_json::from_str("{}").unwrap();
            assert!(settings.first_run);
            assert_eq!(settings.mode, None);
        }

        #[test]
        fn test_device_record_round_trip() {
            let record = DeviceRecord {
                name: "Bathroom".to_string(),
                identity: DeviceIdentity::new("58:2B:DB:01:02:03", "58:2B:DB:01:02:03", Some("1234".into())),
                settings: DeviceSettings {
                    mode: Some(OperatingMode::MultiMode),
                    first_run: false,
                },
            };
            let json = serde_json::to_string(&record).unwrap();
            let parsed: DeviceRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, record);
        }

        #[test]
        fn test_fan_channel_serializes_lowercase() {
            assert_eq!(serde_json::to_string(&FanChannel::Trickle).unwrap(), "\"trickle\"");
        }
    }
}

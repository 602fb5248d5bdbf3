//! Bluetooth UUIDs for PAX Calima fans.
//!
//! The fan exposes its state through vendor characteristics. Characteristics
//! are addressed by UUID alone; the transport resolves the owning service
//! after service discovery.

use uuid::{Uuid, uuid};

/// BLE address prefix assigned to PAX fans.
pub const PAX_ADDRESS_PREFIX: &str = "58:2B:DB";

// --- Calima Characteristic UUIDs ---

/// PIN code characteristic (write, `<I`).
pub const PIN_CODE: Uuid = uuid!("4cad343a-209a-40b7-b911-4d9b3df569b2");

/// Human readable fan description (read, UTF-8).
pub const FAN_DESCRIPTION: Uuid = uuid!("b85fa07a-9382-4838-871c-81d045dcc2ff");

/// Sensor data: humidity, temperature, light, rpm, trigger (read, `<4HBHB`).
pub const SENSOR_DATA: Uuid = uuid!("528b80e8-c47a-4c0a-bdf1-916a7748f412");

/// Operating mode index (read, `<B`).
pub const MODE: Uuid = uuid!("90cabcd1-bcda-4167-85d8-16dcd8ab6a6b");

/// Boost on/off, speed and duration (read/write, `<BHH`).
pub const BOOST: Uuid = uuid!("118c949c-28c8-4139-b0b3-36657fd0c2b0");

/// Humidity, light and trickle target speeds (read/write, `<HHH`).
pub const LEVEL_OF_FAN_SPEED: Uuid = uuid!("1488a757-35bc-4ec8-9a6b-9ecf1502778e");

/// A characteristic of the fan protocol.
///
/// Used by transports to look up the UUID and by logs to name the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    PinCode,
    FanDescription,
    SensorData,
    Mode,
    Boost,
    LevelOfFanSpeed,
}

impl Characteristic {
    /// The characteristic UUID.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        match self {
            Self::PinCode => PIN_CODE,
            Self::FanDescription => FAN_DESCRIPTION,
            Self::SensorData => SENSOR_DATA,
            Self::Mode => MODE,
            Self::Boost => BOOST,
            Self::LevelOfFanSpeed => LEVEL_OF_FAN_SPEED,
        }
    }

    /// Short name used in logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PinCode => "pin_code",
            Self::FanDescription => "fan_description",
            Self::SensorData => "sensor_data",
            Self::Mode => "mode",
            Self::Boost => "boost",
            Self::LevelOfFanSpeed => "level_of_fan_speed",
        }
    }
}

impl core::fmt::Display for Characteristic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids_are_distinct() {
        let all = [
            Characteristic::PinCode,
            Characteristic::FanDescription,
            Characteristic::SensorData,
            Characteristic::Mode,
            Characteristic::Boost,
            Characteristic::LevelOfFanSpeed,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.uuid(), b.uuid(), "{a} and {b} share a UUID");
            }
        }
    }

    #[test]
    fn test_pin_code_uuid() {
        assert_eq!(
            PIN_CODE.to_string(),
            "4cad343a-209a-40b7-b911-4d9b3df569b2"
        );
        assert_eq!(Characteristic::PinCode.uuid(), PIN_CODE);
    }

    #[test]
    fn test_characteristic_display() {
        assert_eq!(Characteristic::SensorData.to_string(), "sensor_data");
        assert_eq!(Characteristic::LevelOfFanSpeed.to_string(), "level_of_fan_speed");
    }

    #[test]
    fn test_address_prefix_is_uppercase() {
        assert_eq!(PAX_ADDRESS_PREFIX, PAX_ADDRESS_PREFIX.to_uppercase());
    }
}

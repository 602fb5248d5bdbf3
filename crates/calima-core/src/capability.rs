//! Capability names and values published to the host.

use std::fmt;

use serde::{Deserialize, Serialize};

use calima_types::FanChannel;

/// A published device property.
///
/// Names are stable; hosts key their UI and flows on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    MeasureTemperature,
    MeasureHumidity,
    MeasureLuminance,
    MeasureRpm,
    /// Active trigger label.
    Mode,
    /// Boost on/off.
    Boost,
    /// Target speed for one channel.
    FanSpeed(FanChannel),
}

impl Capability {
    /// Every capability a fan starts with.
    pub const ALL: [Capability; 9] = [
        Capability::MeasureTemperature,
        Capability::MeasureHumidity,
        Capability::MeasureLuminance,
        Capability::MeasureRpm,
        Capability::Mode,
        Capability::Boost,
        Capability::FanSpeed(FanChannel::Trickle),
        Capability::FanSpeed(FanChannel::Humidity),
        Capability::FanSpeed(FanChannel::Light),
    ];

    /// Stable capability name.
    pub fn name(&self) -> &'static str {
        match self {
            Capability::MeasureTemperature => "measure_temperature",
            Capability::MeasureHumidity => "measure_humidity",
            Capability::MeasureLuminance => "measure_luminance",
            Capability::MeasureRpm => "measure_rpm",
            Capability::Mode => "mode",
            Capability::Boost => "boost",
            Capability::FanSpeed(FanChannel::Trickle) => "fanspeed.trickle",
            Capability::FanSpeed(FanChannel::Humidity) => "fanspeed.humidity",
            Capability::FanSpeed(FanChannel::Light) => "fanspeed.light",
        }
    }

    /// Look up a capability by its stable name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value published for a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CapabilityValue {
    /// Numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CapabilityValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean value, if this is a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CapabilityValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Text value, if this is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CapabilityValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityValue::Bool(b) => write!(f, "{b}"),
            CapabilityValue::Number(n) => write!(f, "{n}"),
            CapabilityValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for CapabilityValue {
    fn from(value: bool) -> Self {
        CapabilityValue::Bool(value)
    }
}

impl From<f64> for CapabilityValue {
    fn from(value: f64) -> Self {
        CapabilityValue::Number(value)
    }
}

impl From<u16> for CapabilityValue {
    fn from(value: u16) -> Self {
        CapabilityValue::Number(f64::from(value))
    }
}

impl From<String> for CapabilityValue {
    fn from(value: String) -> Self {
        CapabilityValue::Text(value)
    }
}

/// Reachability of a device as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Availability {
    /// No sync has finished yet.
    #[default]
    Unknown,
    Available,
    /// Last sync failed; carries the message shown to the user.
    Unavailable(String),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for capability in Capability::ALL {
            assert_eq!(Capability::from_name(capability.name()), Some(capability));
        }
        assert_eq!(Capability::from_name("measure_co2"), None);
    }

    #[test]
    fn test_fan_speed_names() {
        assert_eq!(
            Capability::FanSpeed(FanChannel::Trickle).to_string(),
            "fanspeed.trickle"
        );
        assert_eq!(
            Capability::FanSpeed(FanChannel::Light).name(),
            "fanspeed.light"
        );
    }

    #[test]
    fn test_value_serializes_untagged() {
        assert_eq!(serde_json::to_string(&CapabilityValue::from(true)).unwrap(), "true");
        assert_eq!(serde_json::to_string(&CapabilityValue::from(1000u16)).unwrap(), "1000.0");
        assert_eq!(
            serde_json::to_string(&CapabilityValue::from("Boost".to_string())).unwrap(),
            "\"Boost\""
        );
    }

    #[test]
    fn test_availability_serializes_with_reason() {
        let json = serde_json::to_string(&Availability::Unavailable("out of range".into())).unwrap();
        assert_eq!(json, r#"{"state":"unavailable","reason":"out of range"}"#);
        assert!(!Availability::default().is_available());
    }
}

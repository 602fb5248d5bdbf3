//! Core types for Calima fan state.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Lowest configurable fan speed in RPM.
pub const MIN_SPEED_RPM: u16 = 0;

/// Highest configurable fan speed in RPM.
pub const MAX_SPEED_RPM: u16 = 2500;

/// Fan speeds must be a multiple of this step.
pub const SPEED_STEP_RPM: u16 = 25;

/// Speed used by the device when boost is started.
pub const BOOST_SPEED_RPM: u16 = 2250;

/// What is currently driving the fan, decoded from the status trigger byte.
///
/// `Display` renders the labels published to the `mode` capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Trigger {
    /// Idle, no trigger active.
    #[default]
    None,
    /// Boost override is running.
    Boost,
    /// Trickle (base) ventilation.
    Trickle,
    /// Light-triggered ventilation.
    Light,
    /// Humidity-triggered ventilation.
    Humidity,
}

impl Trigger {
    /// Bit 4 of the trigger byte flags boost.
    const BOOST_BIT: u8 = 1 << 4;
    /// Bits 0-1 select the ventilation channel.
    const CHANNEL_MASK: u8 = 0b11;

    /// Decode the trigger from the raw status byte.
    ///
    /// Boost wins over whatever the low bits say.
    ///
    /// ```
    /// use calima_types::Trigger;
    ///
    /// assert_eq!(Trigger::from_status_byte(0x10), Trigger::Boost);
    /// assert_eq!(Trigger::from_status_byte(0x13), Trigger::Boost);
    /// assert_eq!(Trigger::from_status_byte(0x02), Trigger::Light);
    /// assert_eq!(Trigger::from_status_byte(0x64), Trigger::None);
    /// ```
    #[must_use]
    pub fn from_status_byte(byte: u8) -> Self {
        if byte & Self::BOOST_BIT != 0 {
            return Trigger::Boost;
        }
        match byte & Self::CHANNEL_MASK {
            1 => Trigger::Trickle,
            2 => Trigger::Light,
            3 => Trigger::Humidity,
            _ => Trigger::None,
        }
    }

    /// Label published to the host.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Trigger::None => "No trigger",
            Trigger::Boost => "Boost",
            Trigger::Trickle => "Trickle ventilation",
            Trigger::Light => "Light ventilation",
            Trigger::Humidity => "Humidity ventilation",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Derive relative humidity from the logarithmic raw sensor count.
///
/// ```
/// use calima_types::types::humidity_from_raw;
///
/// assert_eq!(humidity_from_raw(0), 0);
/// assert_eq!(humidity_from_raw(1), 0);
/// assert_eq!(humidity_from_raw(1024), 100);
/// ```
#[must_use]
pub fn humidity_from_raw(raw: u16) -> u8 {
    if raw == 0 {
        return 0;
    }
    // log2(u16::MAX) * 10 < 161, so the cast cannot truncate.
    (f64::from(raw).log2() * 10.0).round() as u8
}

/// Raw sensor-data characteristic payload, field for field.
///
/// The two trailing fields are reserved: they are carried so the payload can
/// be re-encoded byte-exact, but nothing interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorData {
    /// Logarithmic humidity count.
    pub humidity_raw: u16,
    /// Temperature in quarter degrees Celsius.
    pub temperature_raw: u16,
    /// Light sensor count.
    pub light: u16,
    /// Fan speed in RPM.
    pub rpm: u16,
    /// Trigger flags.
    pub trigger: u8,
    /// Reserved, undocumented.
    pub reserved_word: u16,
    /// Reserved, undocumented.
    pub reserved_byte: u8,
}

/// Snapshot of the fan's sensor readings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FanState {
    /// Relative humidity derived from the raw count.
    pub humidity: u8,
    /// Temperature in degrees Celsius.
    pub temperature: f32,
    /// Light sensor count.
    pub light: u16,
    /// Fan speed in RPM.
    pub rpm: u16,
    /// Active trigger.
    pub trigger: Trigger,
}

impl From<SensorData> for FanState {
    fn from(data: SensorData) -> Self {
        FanState {
            humidity: humidity_from_raw(data.humidity_raw),
            temperature: f32::from(data.temperature_raw) / 4.0,
            light: data.light,
            rpm: data.rpm,
            trigger: Trigger::from_status_byte(data.trigger),
        }
    }
}

impl fmt::Display for FanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fan state: Humidity = {}, Temperature = {}, Light = {}, RPM = {}, Mode = {}",
            self.humidity, self.temperature, self.light, self.rpm, self.trigger
        )
    }
}

fn check_speed(field: &str, rpm: u16) -> Result<(), ParseError> {
    if rpm % SPEED_STEP_RPM != 0 {
        return Err(ParseError::InvalidValue(format!(
            "{field} speed {rpm} is not a multiple of {SPEED_STEP_RPM}"
        )));
    }
    if !(MIN_SPEED_RPM..=MAX_SPEED_RPM).contains(&rpm) {
        return Err(ParseError::InvalidValue(format!(
            "{field} speed {rpm} must be between {MIN_SPEED_RPM} and {MAX_SPEED_RPM} rpm"
        )));
    }
    Ok(())
}

/// State of the boost override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoostMode {
    /// Whether boost is running.
    pub on: bool,
    /// Boost speed in RPM; only meaningful when `on`.
    pub speed: u16,
    /// Remaining (read) or requested (write) duration in seconds.
    pub seconds: u16,
}

impl BoostMode {
    /// Boost at the device's boost speed for `seconds`.
    #[must_use]
    pub fn start(seconds: u16) -> Self {
        Self {
            on: true,
            speed: BOOST_SPEED_RPM,
            seconds,
        }
    }

    /// Boost switched off.
    #[must_use]
    pub fn off() -> Self {
        Self::default()
    }

    /// Check the speed is a multiple of [`SPEED_STEP_RPM`].
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.speed % SPEED_STEP_RPM != 0 {
            return Err(ParseError::InvalidValue(format!(
                "boost speed {} is not a multiple of {SPEED_STEP_RPM}",
                self.speed
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BoostMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BoostMode: OnOff = {}, Speed = {}, Seconds = {}",
            self.on, self.speed, self.seconds
        )
    }
}

/// One of the three independently configurable ventilation channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FanChannel {
    Humidity,
    Light,
    Trickle,
}

impl FanChannel {
    /// All channels in wire order.
    pub const ALL: [FanChannel; 3] = [FanChannel::Humidity, FanChannel::Light, FanChannel::Trickle];

    /// Lowercase channel name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FanChannel::Humidity => "humidity",
            FanChannel::Light => "light",
            FanChannel::Trickle => "trickle",
        }
    }
}

impl fmt::Display for FanChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanChannel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "humidity" => Ok(FanChannel::Humidity),
            "light" => Ok(FanChannel::Light),
            "trickle" => Ok(FanChannel::Trickle),
            other => Err(ParseError::InvalidValue(format!(
                "unknown fan channel '{other}'"
            ))),
        }
    }
}

/// Target speed per ventilation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FanSpeed {
    /// Humidity-triggered speed in RPM.
    pub humidity: u16,
    /// Light-triggered speed in RPM.
    pub light: u16,
    /// Trickle speed in RPM.
    pub trickle: u16,
}

impl Default for FanSpeed {
    /// Factory defaults.
    fn default() -> Self {
        Self {
            humidity: 2250,
            light: 1625,
            trickle: 1000,
        }
    }
}

impl FanSpeed {
    /// Create a speed triple.
    #[must_use]
    pub fn new(humidity: u16, light: u16, trickle: u16) -> Self {
        Self {
            humidity,
            light,
            trickle,
        }
    }

    /// Speed of one channel.
    #[must_use]
    pub fn get(&self, channel: FanChannel) -> u16 {
        match channel {
            FanChannel::Humidity => self.humidity,
            FanChannel::Light => self.light,
            FanChannel::Trickle => self.trickle,
        }
    }

    /// Copy with one channel replaced; the other two are kept unchanged.
    #[must_use]
    pub fn with_channel(mut self, channel: FanChannel, rpm: u16) -> Self {
        match channel {
            FanChannel::Humidity => self.humidity = rpm,
            FanChannel::Light => self.light = rpm,
            FanChannel::Trickle => self.trickle = rpm,
        }
        self
    }

    /// Check a single channel value against the device's accepted range.
    pub fn validate_speed(channel: FanChannel, rpm: u16) -> Result<(), ParseError> {
        check_speed(channel.as_str(), rpm)
    }

    /// Check all three channels.
    pub fn validate(&self) -> Result<(), ParseError> {
        for channel in FanChannel::ALL {
            Self::validate_speed(channel, self.get(channel))?;
        }
        Ok(())
    }
}

impl fmt::Display for FanSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fanspeed: Humidity = {}, Light = {}, Trickle = {}",
            self.humidity, self.light, self.trickle
        )
    }
}

/// Fixed personality configured on the fan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OperatingMode {
    MultiMode,
    DraftShutterMode,
    WallSwitchExtendedRuntimeMode,
    WallSwitchNoExtendedRuntimeMode,
    HeatDistributionMode,
    /// Index the protocol does not define.
    Unknown(u8),
}

impl OperatingMode {
    /// Decode the mode index; out-of-range indices become [`OperatingMode::Unknown`].
    #[must_use]
    pub fn from_index(index: u8) -> Self {
        match index {
            0 => OperatingMode::MultiMode,
            1 => OperatingMode::DraftShutterMode,
            2 => OperatingMode::WallSwitchExtendedRuntimeMode,
            3 => OperatingMode::WallSwitchNoExtendedRuntimeMode,
            4 => OperatingMode::HeatDistributionMode,
            other => OperatingMode::Unknown(other),
        }
    }

    /// Wire index of the mode.
    #[must_use]
    pub fn index(&self) -> u8 {
        match self {
            OperatingMode::MultiMode => 0,
            OperatingMode::DraftShutterMode => 1,
            OperatingMode::WallSwitchExtendedRuntimeMode => 2,
            OperatingMode::WallSwitchNoExtendedRuntimeMode => 3,
            OperatingMode::HeatDistributionMode => 4,
            OperatingMode::Unknown(index) => *index,
        }
    }

    /// Heat distribution fans have no boost function.
    #[must_use]
    pub fn supports_boost(&self) -> bool {
        !matches!(self, OperatingMode::HeatDistributionMode)
    }

    /// Whether the index was one the protocol defines.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, OperatingMode::Unknown(_))
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::MultiMode => f.write_str("MultiMode"),
            OperatingMode::DraftShutterMode => f.write_str("DraftShutterMode"),
            OperatingMode::WallSwitchExtendedRuntimeMode => {
                f.write_str("WallSwitchExtendedRuntimeMode")
            }
            OperatingMode::WallSwitchNoExtendedRuntimeMode => {
                f.write_str("WallSwitchNoExtendedRuntimeMode")
            }
            OperatingMode::HeatDistributionMode => f.write_str("HeatDistributionMode"),
            OperatingMode::Unknown(index) => write!(f, "Unknown({index})"),
        }
    }
}

/// PIN used to authenticate mutating writes.
///
/// The fan expects exactly four decimal digits, sent as an integer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pin(u32);

impl Pin {
    /// Parse a four digit PIN.
    ///
    /// ```
    /// use calima_types::Pin;
    ///
    /// assert_eq!(Pin::parse("1234").unwrap().value(), 1234);
    /// assert_eq!(Pin::parse("0042").unwrap().value(), 42);
    /// assert!(Pin::parse("12a4").is_err());
    /// assert!(Pin::parse("12345").is_err());
    /// ```
    pub fn parse(pin: &str) -> Result<Self, ParseError> {
        let pin = pin.trim();
        if pin.len() != 4 || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidValue(
                "PIN must be exactly 4 digits".to_string(),
            ));
        }
        pin.parse::<u32>()
            .map(Pin)
            .map_err(|e| ParseError::InvalidValue(format!("invalid PIN: {e}")))
    }

    /// Integer value written to the device.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(****)")
    }
}

impl FromStr for Pin {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pin::parse(s)
    }
}

/// Identity of a paired fan, written once at pairing time.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceIdentity {
    /// BLE MAC address, uppercase.
    pub address: String,
    /// Advertisement identifier (peripheral UUID on macOS, address elsewhere).
    pub id: String,
    /// Four digit PIN; without it no mutating operation is attempted.
    #[cfg_attr(feature = "serde", serde(default))]
    pub pin: Option<String>,
}

impl DeviceIdentity {
    /// Create an identity, normalising the address to uppercase.
    pub fn new(address: impl Into<String>, id: impl Into<String>, pin: Option<String>) -> Self {
        Self {
            address: address.into().to_uppercase(),
            id: id.into(),
            pin,
        }
    }

    /// Whether `identifier` names this device by id or address.
    #[must_use]
    pub fn matches(&self, identifier: &str) -> bool {
        self.id.eq_ignore_ascii_case(identifier) || self.address.eq_ignore_ascii_case(identifier)
    }
}

/// Mutable per-device settings persisted by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceSettings {
    /// Operating mode read at pairing time.
    #[cfg_attr(feature = "serde", serde(default))]
    pub mode: Option<OperatingMode>,
    /// Set at pairing; cleared after the first-run capability check.
    #[cfg_attr(feature = "serde", serde(default = "default_first_run"))]
    pub first_run: bool,
}

#[cfg(feature = "serde")]
fn default_first_run() -> bool {
    true
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            mode: None,
            first_run: true,
        }
    }
}

impl DeviceSettings {
    /// Whether the Boost capability applies to this device.
    ///
    /// A device whose mode is unknown keeps boost.
    #[must_use]
    pub fn supports_boost(&self) -> bool {
        self.mode.is_none_or(|m| m.supports_boost())
    }
}

/// Everything the host persists about a paired fan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceRecord {
    /// Name read from the fan description characteristic.
    pub name: String,
    /// Pairing-time identity.
    pub identity: DeviceIdentity,
    /// Mutable settings.
    pub settings: DeviceSettings,
}

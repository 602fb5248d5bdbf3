//! Fixed-layout little-endian encoding of the fan's characteristic payloads.
//!
//! Fixed-layout decoders require the exact payload length: a short payload
//! fails with [`ParseError::InsufficientBytes`], a long one with
//! [`ParseError::UnexpectedLength`]. Only the free-text name is variable.

use bytes::{Buf, BufMut};

use crate::error::ParseError;
use crate::types::{BoostMode, FanSpeed, OperatingMode, Pin, SensorData};

/// Length of the sensor data payload (`<4HBHB`).
pub const SENSOR_DATA_BYTES: usize = 12;

/// Length of the boost payload (`<BHH`).
pub const BOOST_BYTES: usize = 5;

/// Length of the fan speed payload (`<HHH`).
pub const FAN_SPEED_BYTES: usize = 6;

/// Length of the mode payload (`<B`).
pub const MODE_BYTES: usize = 1;

/// Length of the PIN payload (`<I`).
pub const PIN_BYTES: usize = 4;

fn ensure_len(data: &[u8], expected: usize) -> Result<(), ParseError> {
    match data.len() {
        actual if actual < expected => Err(ParseError::InsufficientBytes { expected, actual }),
        actual if actual > expected => Err(ParseError::UnexpectedLength { expected, actual }),
        _ => Ok(()),
    }
}

impl SensorData {
    /// Parse the sensor data characteristic.
    ///
    /// Layout:
    /// - bytes 0-1: humidity count (u16 LE)
    /// - bytes 2-3: temperature, quarter degrees (u16 LE)
    /// - bytes 4-5: light (u16 LE)
    /// - bytes 6-7: rpm (u16 LE)
    /// - byte 8: trigger flags (u8)
    /// - bytes 9-10: reserved (u16 LE)
    /// - byte 11: reserved (u8)
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] or
    /// [`ParseError::UnexpectedLength`] unless `data` is exactly
    /// [`SENSOR_DATA_BYTES`] bytes.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        ensure_len(data, SENSOR_DATA_BYTES)?;

        let mut buf = data;
        Ok(SensorData {
            humidity_raw: buf.get_u16_le(),
            temperature_raw: buf.get_u16_le(),
            light: buf.get_u16_le(),
            rpm: buf.get_u16_le(),
            trigger: buf.get_u8(),
            reserved_word: buf.get_u16_le(),
            reserved_byte: buf.get_u8(),
        })
    }

    /// Encode to the wire layout.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SENSOR_DATA_BYTES);
        buf.put_u16_le(self.humidity_raw);
        buf.put_u16_le(self.temperature_raw);
        buf.put_u16_le(self.light);
        buf.put_u16_le(self.rpm);
        buf.put_u8(self.trigger);
        buf.put_u16_le(self.reserved_word);
        buf.put_u8(self.reserved_byte);
        buf
    }
}

impl BoostMode {
    /// Parse the boost characteristic (`<BHH`: on, speed, seconds).
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] or
    /// [`ParseError::UnexpectedLength`] unless `data` is exactly
    /// [`BOOST_BYTES`] bytes.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        ensure_len(data, BOOST_BYTES)?;

        let mut buf = data;
        Ok(BoostMode {
            on: buf.get_u8() != 0,
            speed: buf.get_u16_le(),
            seconds: buf.get_u16_le(),
        })
    }

    /// Encode for writing.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BOOST_BYTES);
        buf.put_u8(u8::from(self.on));
        buf.put_u16_le(self.speed);
        buf.put_u16_le(self.seconds);
        buf
    }
}

impl FanSpeed {
    /// Parse the fan speed characteristic (`<HHH`: humidity, light, trickle).
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] or
    /// [`ParseError::UnexpectedLength`] unless `data` is exactly
    /// [`FAN_SPEED_BYTES`] bytes.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        ensure_len(data, FAN_SPEED_BYTES)?;

        let mut buf = data;
        Ok(FanSpeed {
            humidity: buf.get_u16_le(),
            light: buf.get_u16_le(),
            trickle: buf.get_u16_le(),
        })
    }

    /// Encode for writing.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FAN_SPEED_BYTES);
        buf.put_u16_le(self.humidity);
        buf.put_u16_le(self.light);
        buf.put_u16_le(self.trickle);
        buf
    }
}

impl OperatingMode {
    /// Parse the mode characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] on an empty payload and
    /// [`ParseError::UnexpectedLength`] on more than one byte.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        ensure_len(data, MODE_BYTES)?;
        Ok(OperatingMode::from_index(data[0]))
    }

    /// Encode for writing.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![self.index()]
    }
}

impl Pin {
    /// Encode as the little-endian u32 the PIN characteristic expects.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.value().to_le_bytes().to_vec()
    }

    /// Decode the integer form written to the PIN characteristic.
    ///
    /// # Errors
    ///
    /// Returns a length error unless `data` is exactly [`PIN_BYTES`], or [`ParseError::InvalidValue`] if the value has more
    /// than four digits.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        ensure_len(data, PIN_BYTES)?;
        let mut buf = data;
        let value = buf.get_u32_le();
        Pin::parse(&format!("{value:04}"))
    }
}

/// Decode the fan description: UTF-8, trailing NUL padding removed.
///
/// # Errors
///
/// Returns [`ParseError::InvalidText`] if the payload is not valid UTF-8.
pub fn decode_name(data: &[u8]) -> Result<String, ParseError> {
    let text = std::str::from_utf8(data).map_err(|e| ParseError::InvalidText(e.to_string()))?;
    Ok(text.trim_end_matches('\0').trim().to_string())
}

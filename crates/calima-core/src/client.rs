//! Protocol operations over an open link.
//!
//! [`ProtocolClient`] sequences the fan's operations: every mutating call
//! validates its input, authenticates with the PIN, and only then writes.
//! It never reconnects on its own; failures come back wrapped in
//! [`Error::Protocol`] with the failing operation named.

use std::sync::Arc;

use tracing::debug;

use calima_types::{
    BoostMode, Characteristic, FanSpeed, FanState, OperatingMode, Pin, SensorData, decode_name,
};

use crate::error::{Error, Result};
use crate::traits::Link;

/// Client for one open link.
#[derive(Clone)]
pub struct ProtocolClient {
    link: Arc<dyn Link>,
    pin: Option<String>,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("address", &self.link.address())
            .field("has_pin", &self.pin.is_some())
            .finish()
    }
}

impl ProtocolClient {
    /// Bind a client to `link`. Without a PIN only reads are possible.
    pub fn new(link: Arc<dyn Link>, pin: Option<String>) -> Self {
        Self { link, pin }
    }

    /// The underlying link.
    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    async fn read(&self, operation: &str, characteristic: Characteristic) -> Result<Vec<u8>> {
        self.link
            .read(characteristic)
            .await
            .map_err(|e| Error::protocol(operation, e))
    }

    async fn write(&self, operation: &str, characteristic: Characteristic, data: &[u8]) -> Result<()> {
        self.link
            .write(characteristic, data)
            .await
            .map_err(|e| Error::protocol(operation, e))
    }

    /// Write `pin` to the PIN characteristic.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if `pin` is not four digits, or
    /// [`Error::AuthenticationFailed`] if the fan refuses the write.
    pub async fn authenticate(&self, pin: &str) -> Result<()> {
        let pin = Pin::parse(pin).map_err(Error::validation)?;
        self.link
            .write(Characteristic::PinCode, &pin.to_bytes())
            .await
            .map_err(|e| Error::auth_failed(format!("unable to write PIN: {e}")))?;
        debug!(address = %self.link.address(), "Authenticated");
        Ok(())
    }

    async fn authenticate_stored(&self) -> Result<()> {
        match &self.pin {
            Some(pin) => self.authenticate(pin).await,
            None => Err(Error::auth_failed("no PIN configured for this device")),
        }
    }

    /// Read the fan description.
    pub async fn get_name(&self) -> Result<String> {
        let data = self.read("get_name", Characteristic::FanDescription).await?;
        let name = decode_name(&data).map_err(|e| Error::protocol("get_name", e.into()))?;
        debug!("Got device name: {name}");
        Ok(name)
    }

    /// Read the operating mode; unknown indices decode to [`OperatingMode::Unknown`].
    pub async fn get_operating_mode(&self) -> Result<OperatingMode> {
        let data = self
            .read("get_operating_mode", Characteristic::Mode)
            .await?;
        let mode = OperatingMode::from_bytes(&data)
            .map_err(|e| Error::protocol("get_operating_mode", e.into()))?;
        debug!("Got operating mode: {mode}");
        Ok(mode)
    }

    /// Read name and mode in one go, as discovery needs.
    pub async fn get_name_and_mode(&self) -> Result<(String, OperatingMode)> {
        let name = self.get_name().await?;
        let mode = self.get_operating_mode().await?;
        Ok((name, mode))
    }

    /// Read and derive the sensor snapshot.
    pub async fn get_status(&self) -> Result<FanState> {
        let data = self.read("get_status", Characteristic::SensorData).await?;
        let raw =
            SensorData::from_bytes(&data).map_err(|e| Error::protocol("get_status", e.into()))?;
        let state = FanState::from(raw);
        debug!("{state}");
        Ok(state)
    }

    /// Read the three channel speeds.
    pub async fn get_fan_speed(&self) -> Result<FanSpeed> {
        let data = self
            .read("get_fan_speed", Characteristic::LevelOfFanSpeed)
            .await?;
        let speed =
            FanSpeed::from_bytes(&data).map_err(|e| Error::protocol("get_fan_speed", e.into()))?;
        debug!("{speed}");
        Ok(speed)
    }

    /// Write all three channel speeds.
    ///
    /// Each value must be a multiple of 25 within 0..=2500; nothing is sent
    /// to the fan otherwise.
    pub async fn set_fan_speed(&self, humidity: u16, light: u16, trickle: u16) -> Result<()> {
        let speed = FanSpeed::new(humidity, light, trickle);
        speed.validate().map_err(Error::validation)?;

        self.authenticate_stored().await?;
        self.write("set_fan_speed", Characteristic::LevelOfFanSpeed, &speed.to_bytes())
            .await?;
        debug!("Set {speed}");
        Ok(())
    }

    /// Read boost state.
    pub async fn get_boost_mode(&self) -> Result<BoostMode> {
        let data = self.read("get_boost_mode", Characteristic::Boost).await?;
        let boost =
            BoostMode::from_bytes(&data).map_err(|e| Error::protocol("get_boost_mode", e.into()))?;
        debug!("{boost}");
        Ok(boost)
    }

    /// Write boost state; `speed` must be a multiple of 25.
    pub async fn set_boost_mode(&self, on: bool, speed: u16, seconds: u16) -> Result<()> {
        let boost = BoostMode { on, speed, seconds };
        boost.validate().map_err(Error::validation)?;

        self.authenticate_stored().await?;
        self.write("set_boost_mode", Characteristic::Boost, &boost.to_bytes())
            .await?;
        debug!("Set {boost}");
        Ok(())
    }

    /// Start boost at the boost speed for `seconds`.
    pub async fn start_boost(&self, seconds: u16) -> Result<()> {
        let boost = BoostMode::start(seconds);
        self.set_boost_mode(boost.on, boost.speed, boost.seconds)
            .await
    }

    /// Stop boost. Safe to call when boost is already off.
    pub async fn stop_boost(&self) -> Result<()> {
        self.set_boost_mode(false, 0, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockFan};

    fn client(fan: &Arc<MockFan>, pin: Option<&str>) -> ProtocolClient {
        fan.force_connected();
        ProtocolClient::new(fan.clone(), pin.map(str::to_string))
    }

    #[tokio::test]
    async fn test_get_status() {
        let fan = Arc::new(MockFan::builder().humidity_raw(1024).temperature_raw(80).build());
        let state = client(&fan, None).get_status().await.unwrap();
        assert_eq!(state.humidity, 100);
        assert!((state.temperature - 20.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_get_name_and_mode() {
        let fan = Arc::new(
            MockFan::builder()
                .name("Bathroom fan")
                .mode(OperatingMode::HeatDistributionMode)
                .build(),
        );
        let (name, mode) = client(&fan, None).get_name_and_mode().await.unwrap();
        assert_eq!(name, "Bathroom fan");
        assert_eq!(mode, OperatingMode::HeatDistributionMode);
    }

    #[tokio::test]
    async fn test_unknown_mode_is_not_an_error() {
        let fan = Arc::new(MockFan::builder().mode(OperatingMode::Unknown(9)).build());
        let mode = client(&fan, None).get_operating_mode().await.unwrap();
        assert_eq!(mode, OperatingMode::Unknown(9));
    }

    #[tokio::test]
    async fn test_invalid_name_is_protocol_error() {
        let fan = Arc::new(MockFan::builder().raw_name(vec![0xFF, 0xFE]).build());
        let err = client(&fan, None).get_name().await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_set_fan_speed_accepts_bounds() {
        let fan = Arc::new(MockFan::builder().pin("1234").build());
        let client = client(&fan, Some("1234"));
        for rpm in [0u16, 25, 2500] {
            client.set_fan_speed(rpm, rpm, rpm).await.unwrap();
        }
        assert_eq!(fan.fan_speed(), FanSpeed::new(2500, 2500, 2500));
    }

    #[tokio::test]
    async fn test_set_fan_speed_rejects_without_touching_transport() {
        let fan = Arc::new(MockFan::builder().pin("1234").build());
        let client = client(&fan, Some("1234"));
        fan.clear_calls();

        for rpm in [2501u16, 24, 1010] {
            let err = client.set_fan_speed(2250, 1625, rpm).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{rpm}: {err}");
        }
        assert!(fan.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_without_pin_writes_nothing() {
        let fan = Arc::new(MockFan::builder().build());
        let client = client(&fan, None);
        fan.clear_calls();

        let err = client.start_boost(600).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed { .. }));
        assert!(fan.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_pin_is_authentication_failure() {
        let fan = Arc::new(MockFan::builder().pin("1234").build());
        let client = client(&fan, Some("4321"));

        let err = client.set_fan_speed(2250, 1625, 1000).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed { .. }));
        assert_eq!(fan.fan_speed(), FanSpeed::default());
    }

    #[tokio::test]
    async fn test_malformed_pin_is_validation_error() {
        let fan = Arc::new(MockFan::builder().build());
        let err = client(&fan, None).authenticate("12a4").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_write_authenticates_first() {
        let fan = Arc::new(MockFan::builder().pin("1234").build());
        let client = client(&fan, Some("1234"));
        fan.clear_calls();

        client.start_boost(900).await.unwrap();
        let calls = fan.calls();
        assert_eq!(
            calls,
            vec![
                MockCall::Write(Characteristic::PinCode, vec![0xD2, 0x04, 0x00, 0x00]),
                MockCall::Write(Characteristic::Boost, vec![0x01, 0xCA, 0x08, 0x84, 0x03]),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_boost_is_idempotent() {
        let fan = Arc::new(MockFan::builder().pin("1234").build());
        let client = client(&fan, Some("1234"));

        client.stop_boost().await.unwrap();
        client.stop_boost().await.unwrap();
        assert!(!client.get_boost_mode().await.unwrap().on);
    }

    #[tokio::test]
    async fn test_boost_speed_must_be_multiple_of_25() {
        let fan = Arc::new(MockFan::builder().pin("1234").build());
        let err = client(&fan, Some("1234"))
            .set_boost_mode(true, 2260, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_read_failure_is_wrapped() {
        let fan = Arc::new(MockFan::builder().build());
        let client = client(&fan, None);
        fan.set_should_fail(true);

        match client.get_fan_speed().await.unwrap_err() {
            Error::Protocol { operation, .. } => assert_eq!(operation, "get_fan_speed"),
            other => panic!("unexpected error: {other}"),
        }
    }
}

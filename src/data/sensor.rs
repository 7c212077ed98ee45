//! Environmental beacon payload decoding.
//!
//! MM-BLEBC2 style beacons put battery, temperature and humidity into the
//! 16-bit service data field. Offsets below are byte offsets into that
//! field's value, which starts with the little-endian service UUID.

use crate::error::DecodeError;
use crate::utils::parse_hex;

/// Offset of the battery byte.
pub const BATTERY_OFFSET: usize = 4;
/// Offset of the two-byte temperature field.
pub const TEMPERATURE_OFFSET: usize = 5;
/// Offset of the two-byte humidity field.
pub const HUMIDITY_OFFSET: usize = 7;
/// Minimum payload length. The second humidity byte is optional.
pub const MIN_PAYLOAD_LEN: usize = HUMIDITY_OFFSET + 1;

/// Battery byte value reported by a full battery.
const BATTERY_FULL_SCALE: u8 = 0x64;

/// One decoded beacon reading.
///
/// Values outside plausible sensor ranges are passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorReading {
    /// Battery level in percent.
    pub battery: f64,
    /// Temperature in degrees Celsius.
    pub temperature: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
}

impl SensorReading {
    /// Create a reading from its three values.
    pub fn new(battery: f64, temperature: f64, humidity: f64) -> Self {
        Self {
            battery,
            temperature,
            humidity,
        }
    }

    /// Decode a hex-encoded service data value.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for non-hex input or a payload shorter than
    /// [`MIN_PAYLOAD_LEN`] bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use ble_scan_kit::data::SensorReading;
    ///
    /// let reading = SensorReading::from_hex("aabbccdd64019602").unwrap();
    /// assert_eq!(reading.battery, 100.0);
    /// assert_eq!(reading.temperature, 1.0 + 9.0 / 16.0 + 6.0 / 256.0);
    /// ```
    pub fn from_hex(service_data_hex: &str) -> Result<Self, DecodeError> {
        Self::from_bytes(&parse_hex(service_data_hex)?)
    }

    /// Decode a raw service data value.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < MIN_PAYLOAD_LEN {
            return Err(DecodeError::TooShort {
                required: MIN_PAYLOAD_LEN,
                actual: data.len(),
            });
        }

        let battery = f64::from(data[BATTERY_OFFSET]) * 100.0 / f64::from(BATTERY_FULL_SCALE);
        let temperature = fixed_point(&data[TEMPERATURE_OFFSET..TEMPERATURE_OFFSET + 2]);
        let humidity_end = (HUMIDITY_OFFSET + 2).min(data.len());
        let humidity = fixed_point(&data[HUMIDITY_OFFSET..humidity_end]);

        Ok(Self {
            battery,
            temperature,
            humidity,
        })
    }
}

impl std::fmt::Display for SensorReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "battery: {:.0} % temperature: {:.1} 'C humidity: {:.1} %",
            self.battery, self.temperature, self.humidity
        )
    }
}

/// Big-endian 8.8 fixed point: `int + frac_nibble / 16 + subfrac_nibble / 256`.
///
/// A single byte is read as the fractional part only.
fn fixed_point(field: &[u8]) -> f64 {
    let raw = field
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    let integer = raw >> 8;
    let fraction = (raw >> 4) & 0x0f;
    let sub_fraction = raw & 0x0f;
    f64::from(integer) + f64::from(fraction) / 16.0 + f64::from(sub_fraction) / 256.0
}

/// Decode a hex-encoded service data value into a [`SensorReading`].
pub fn decode_sensor_payload(service_data_hex: &str) -> Result<SensorReading, DecodeError> {
    SensorReading::from_hex(service_data_hex)
}

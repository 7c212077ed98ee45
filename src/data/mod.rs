//! Decoded data types.
//!
//! Beacon sensor readings and the trailing histories used to average them.

pub mod history;
pub mod sensor;

pub use history::{ReadingHistory, TrailingHistory};
pub use sensor::{decode_sensor_payload, SensorReading};

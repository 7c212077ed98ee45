//! BLE communication module.
//!
//! The adapter interface, advertisement decoding, and the btleplug backend.

pub mod adapter;
pub mod advertising;
pub mod connection;
pub mod scanner;
pub mod uuids;

pub use adapter::{
    properties_to_string, AddressType, BleAdapter, CharacteristicInfo, DiscoveryEvent,
    GattConnection, ScanOptions, ServiceInfo,
};
pub use btleplug::api::CharPropFlags;
pub use advertising::{AdvertisementField, FieldKind, FieldValue, ScanDataEntry};
pub use connection::{BtleplugConnection, ConnectionState};
pub use scanner::BtleplugAdapter;
pub use uuids::*;

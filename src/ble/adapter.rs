//! Adapter interface.
//!
//! The scan loop and the GATT inspector only talk to the radio through the
//! [`BleAdapter`] and [`GattConnection`] traits, so they can be driven by the
//! btleplug backend or by a scripted adapter in tests.

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use futures::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::advertising::ScanDataEntry;
use crate::error::Result;

/// Bluetooth device address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressType {
    /// Public (IEEE assigned) address.
    #[default]
    Public,
    /// Random (static or private) address.
    Random,
}

impl std::fmt::Display for AddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Random => write!(f, "random"),
        }
    }
}

impl From<btleplug::api::AddressType> for AddressType {
    fn from(value: btleplug::api::AddressType) -> Self {
        match value {
            btleplug::api::AddressType::Public => Self::Public,
            btleplug::api::AddressType::Random => Self::Random,
        }
    }
}

/// One advertisement report from the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryEvent {
    /// Device address, lower case.
    pub address: String,
    /// Address type.
    pub address_type: AddressType,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Whether the device accepts connections.
    pub connectable: bool,
    /// Advertisement content as reported by the adapter.
    pub scan_data: Vec<ScanDataEntry>,
    /// The adapter has not reported this address before.
    pub is_new_device: bool,
    /// The advertisement content changed.
    pub is_new_data: bool,
}

impl DiscoveryEvent {
    /// Create an event for a first sighting of `address`.
    pub fn new_device(address: impl Into<String>, scan_data: Vec<ScanDataEntry>) -> Self {
        Self {
            address: normalize_address(&address.into()),
            address_type: AddressType::Public,
            rssi: 0,
            connectable: true,
            scan_data,
            is_new_device: true,
            is_new_data: true,
        }
    }

    /// Create an event for a repeated sighting with fresh data.
    pub fn updated(address: impl Into<String>, scan_data: Vec<ScanDataEntry>) -> Self {
        Self {
            is_new_device: false,
            ..Self::new_device(address, scan_data)
        }
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Set the connectable flag.
    pub fn with_connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }

    /// Set the address type.
    pub fn with_address_type(mut self, address_type: AddressType) -> Self {
        self.address_type = address_type;
        self
    }
}

/// Lower-case an address so `AA:BB` and `aa:bb` compare equal.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Options for one scan call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOptions {
    /// How long to scan. `None` scans until the adapter is stopped.
    pub duration: Option<Duration>,
    /// Passive scanning (no scan requests).
    pub passive: bool,
}

const PROPERTY_NAMES: [(CharPropFlags, &str); 8] = [
    (CharPropFlags::BROADCAST, "BROADCAST"),
    (CharPropFlags::READ, "READ"),
    (CharPropFlags::WRITE_WITHOUT_RESPONSE, "WRITE NO RESPONSE"),
    (CharPropFlags::WRITE, "WRITE"),
    (CharPropFlags::NOTIFY, "NOTIFY"),
    (CharPropFlags::INDICATE, "INDICATE"),
    (CharPropFlags::AUTHENTICATED_SIGNED_WRITES, "AUTHENTICATED SIGNED WRITES"),
    (CharPropFlags::EXTENDED_PROPERTIES, "EXTENDED PROPERTIES"),
];

/// Render property flags as space-separated names, e.g. `READ NOTIFY`.
pub fn properties_to_string(flags: CharPropFlags) -> String {
    PROPERTY_NAMES
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A primary service as reported by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: Uuid,
    /// First attribute handle of the service.
    pub start_handle: u16,
    /// Last attribute handle of the service.
    pub end_handle: u16,
}

/// A characteristic as reported by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Value handle.
    pub handle: u16,
    /// Property flags.
    pub properties: CharPropFlags,
}

/// Source of discovery events and connections.
///
/// Only one scan and one connection are expected to be in flight at a time.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Start scanning. The stream ends when `options.duration` elapses or,
    /// for an unbounded scan, when [`BleAdapter::stop_scan`] is called.
    async fn scan(&self, options: ScanOptions) -> Result<BoxStream<'static, DiscoveryEvent>>;

    /// Stop an ongoing scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a GATT connection.
    async fn connect(
        &self,
        address: &str,
        address_type: AddressType,
    ) -> Result<Box<dyn GattConnection>>;
}

/// An open GATT connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GattConnection: Send + Sync {
    /// List primary services.
    async fn services(&self) -> Result<Vec<ServiceInfo>>;

    /// List the characteristics of one service.
    async fn characteristics(&self, service: &ServiceInfo) -> Result<Vec<CharacteristicInfo>>;

    /// Read a characteristic value by handle.
    async fn read(&self, handle: u16) -> Result<Vec<u8>>;

    /// Write a characteristic value by handle.
    async fn write(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()>;

    /// Release the connection.
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_to_string() {
        assert_eq!(
            properties_to_string(CharPropFlags::READ | CharPropFlags::NOTIFY),
            "READ NOTIFY"
        );
        assert_eq!(
            properties_to_string(CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::WRITE),
            "WRITE NO RESPONSE WRITE"
        );
        assert_eq!(properties_to_string(CharPropFlags::empty()), "");
    }

    #[test]
    fn test_event_builders_normalize_address() {
        let event = DiscoveryEvent::updated("AA:BB:CC:DD:EE:01", vec![]).with_rssi(-60);
        assert_eq!(event.address, "aa:bb:cc:dd:ee:01");
        assert!(!event.is_new_device);
        assert!(event.is_new_data);
        assert_eq!(event.rssi, -60);
    }
}

//! Devices seen during one scan session.
//!
//! The registry classifies every discovery event, applies the allow-list
//! filter, and keeps one [`DiscoveredDevice`] per address in the order the
//! devices were first accepted.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::trace;
use uuid::Uuid;

use crate::ble::adapter::{normalize_address, AddressType, DiscoveryEvent};
use crate::ble::advertising::{self, AdvertisementField, FieldValue, ScanDataEntry};
use crate::ble::uuids::short_uuid;

/// How the registry classified a discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiscoveryClass {
    /// First sighting of an address that passes the filter.
    New,
    /// Fresh advertisement data for an address that passes the filter.
    UpdatedKnown,
    /// Fresh advertisement data for an address that fails the filter.
    UpdatedFiltered,
    /// Nothing new.
    Ignored,
}

impl DiscoveryClass {
    /// Check if the event should be reported and may trigger inspection.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::New | Self::UpdatedKnown)
    }

    /// Log marker: `[N]`, `[U]` or `[-]`.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::New => "[N]",
            Self::UpdatedKnown => "[U]",
            Self::UpdatedFiltered | Self::Ignored => "[-]",
        }
    }
}

impl std::fmt::Display for DiscoveryClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::UpdatedKnown => write!(f, "UpdatedKnown"),
            Self::UpdatedFiltered => write!(f, "UpdatedFiltered"),
            Self::Ignored => write!(f, "Ignored"),
        }
    }
}

/// Allow-list of addresses, advertised service UUIDs and local names.
///
/// Entries are compared case-insensitively. A service UUID matches in its
/// full form or, for Bluetooth base UUIDs, as its four-digit short form
/// (`ffe1`). An empty filter allows every device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceFilter {
    entries: Vec<String>,
}

impl DeviceFilter {
    /// Build a filter from allow-list entries.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.as_ref().trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// A filter that allows every device.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Check if the filter has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The normalized entries.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Check if `device` passes the filter.
    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        if self.entries.is_empty() {
            return true;
        }

        let name = device.local_name.as_deref().map(str::to_lowercase);
        let uuids = device.advertised_services();

        self.entries.iter().any(|entry| {
            *entry == device.address
                || name.as_deref() == Some(entry.as_str())
                || uuids.iter().any(|uuid| uuid_matches(uuid, entry))
        })
    }
}

fn uuid_matches(uuid: &Uuid, entry: &str) -> bool {
    if uuid.to_string() == entry {
        return true;
    }
    short_uuid(uuid).map_or(false, |short| format!("{:04x}", short) == entry)
}

/// A device seen during the current session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Lower-case address.
    pub address: String,
    /// Address type.
    pub address_type: AddressType,
    /// Signal strength of the latest advertisement, in dBm.
    pub rssi: i16,
    /// Whether the device accepts connections.
    pub connectable: bool,
    /// Latest advertisement as reported by the adapter.
    pub scan_data: Vec<ScanDataEntry>,
    /// Latest advertisement, decoded.
    pub fields: Vec<AdvertisementField>,
    /// Local name, kept from an earlier advertisement if the latest lacks one.
    pub local_name: Option<String>,
    /// When the device was first accepted.
    pub first_seen: DateTime<Utc>,
    /// When the device was last refreshed.
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Create a device from its first discovery event.
    pub fn from_event(event: &DiscoveryEvent) -> Self {
        let fields = advertising::decode(&event.scan_data);
        let now = Utc::now();
        Self {
            address: normalize_address(&event.address),
            address_type: event.address_type,
            rssi: event.rssi,
            connectable: event.connectable,
            local_name: advertising::extract_local_name(&fields),
            scan_data: event.scan_data.clone(),
            fields,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Refresh the device in place from a later event.
    pub fn update(&mut self, event: &DiscoveryEvent) {
        self.address_type = event.address_type;
        self.rssi = event.rssi;
        self.connectable = event.connectable;
        self.scan_data = event.scan_data.clone();
        self.fields = advertising::decode(&event.scan_data);
        if let Some(name) = advertising::extract_local_name(&self.fields) {
            self.local_name = Some(name);
        }
        self.last_seen = Utc::now();
    }

    /// Service UUIDs listed in the latest advertisement.
    pub fn advertised_services(&self) -> Vec<Uuid> {
        self.fields
            .iter()
            .filter_map(|f| match &f.value {
                FieldValue::Uuids(uuids) => Some(uuids.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Check if the latest advertisement lists `service` as a complete 16-bit UUID.
    pub fn advertises_service(&self, service: &Uuid) -> bool {
        advertising::advertises_service(&self.fields, service)
    }

    /// Raw value text of the first 16-bit service data entry.
    pub fn service_data_hex(&self) -> Option<&str> {
        self.scan_data
            .iter()
            .find(|e| e.ad_type == advertising::AD_TYPE_SERVICE_16B_DATA)
            .map(|e| e.value.as_str())
    }

    /// One-line summary, e.g.
    /// `Device "MM-BLEBC2"[aa:bb:cc:dd:ee:01](public) -60 dBm connectable:true`.
    pub fn summary(&self) -> String {
        let name = match &self.local_name {
            Some(name) => format!("\"{}\"", name),
            None => String::new(),
        };
        format!(
            "Device {}[{}]({}) {} dBm connectable:{}",
            name, self.address, self.address_type, self.rssi, self.connectable
        )
    }

    /// One line per advertisement entry, or `(no data)`.
    pub fn advertisement_lines(&self) -> Vec<String> {
        if self.scan_data.is_empty() {
            return vec!["(no data)".to_string()];
        }
        self.scan_data
            .iter()
            .map(|e| format!("{}: \"{}\"", e.description, e.value))
            .collect()
    }
}

/// Insertion-ordered set of discovered devices.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    filter: DeviceFilter,
    devices: Vec<DiscoveredDevice>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    /// Create an empty registry with `filter`.
    pub fn new(filter: DeviceFilter) -> Self {
        Self {
            filter,
            devices: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// The allow-list in use.
    pub fn filter(&self) -> &DeviceFilter {
        &self.filter
    }

    /// Classify `event` and record the device when it is accepted.
    ///
    /// A device is inserted or refreshed only for [`DiscoveryClass::New`] and
    /// [`DiscoveryClass::UpdatedKnown`].
    pub fn observe(&mut self, event: &DiscoveryEvent) -> DiscoveryClass {
        let address = normalize_address(&event.address);
        let tracked = self.index.get(&address).copied();

        if !event.is_new_device && !event.is_new_data {
            return DiscoveryClass::Ignored;
        }

        let candidate = match tracked {
            Some(i) => {
                let mut device = self.devices[i].clone();
                device.update(event);
                device
            }
            None => DiscoveredDevice::from_event(event),
        };

        if !self.filter.matches(&candidate) {
            trace!("{} filtered out", address);
            return if event.is_new_data {
                DiscoveryClass::UpdatedFiltered
            } else {
                DiscoveryClass::Ignored
            };
        }

        match tracked {
            Some(i) => {
                self.devices[i] = candidate;
                DiscoveryClass::UpdatedKnown
            }
            None => {
                self.index.insert(address, self.devices.len());
                self.devices.push(candidate);
                if event.is_new_device {
                    DiscoveryClass::New
                } else {
                    DiscoveryClass::UpdatedKnown
                }
            }
        }
    }

    /// Look up a device by address (any case).
    pub fn get(&self, address: &str) -> Option<&DiscoveredDevice> {
        self.index
            .get(&normalize_address(address))
            .map(|&i| &self.devices[i])
    }

    /// Devices in the order they were first accepted.
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.devices.iter()
    }

    /// Copy of every device, in insertion order.
    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.devices.clone()
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if no device has been accepted.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forget every device, keeping the filter.
    pub fn clear(&mut self) {
        self.devices.clear();
        self.index.clear();
    }
}

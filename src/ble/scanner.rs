//! btleplug scanning backend.
//!
//! Implements [`BleAdapter`] on top of a system Bluetooth adapter.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::ble::adapter::{
    normalize_address, AddressType, BleAdapter, DiscoveryEvent, GattConnection, ScanOptions,
};
use crate::ble::advertising::{
    ScanDataEntry, AD_TYPE_COMPLETE_128B_SERVICES, AD_TYPE_COMPLETE_16B_SERVICES,
    AD_TYPE_COMPLETE_LOCAL_NAME, AD_TYPE_MANUFACTURER, AD_TYPE_SERVICE_16B_DATA,
    AD_TYPE_TX_POWER,
};
use crate::ble::connection::BtleplugConnection;
use crate::ble::uuids::short_uuid;
use crate::error::{Error, Result};
use crate::utils::to_hex;

/// Peripherals seen during scans, by normalized address.
type PeripheralMap = Arc<RwLock<HashMap<String, Peripheral>>>;

/// [`BleAdapter`] backed by a btleplug adapter.
pub struct BtleplugAdapter {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Peripherals discovered so far.
    peripherals: PeripheralMap,
}

impl BtleplugAdapter {
    /// Use the first system adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_index(0).await
    }

    /// Use the system adapter at `index` (`hci<index>` on Linux).
    pub async fn with_index(index: usize) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;
        if adapters.is_empty() {
            return Err(Error::BluetoothUnavailable);
        }

        let adapter = adapters
            .into_iter()
            .nth(index)
            .ok_or(Error::AdapterNotFound { index })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Wrap an already selected adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Turn a central event into a discovery event.
    async fn process_event(
        adapter: &Adapter,
        peripherals: &PeripheralMap,
        event: CentralEvent,
    ) -> Option<DiscoveryEvent> {
        let (id, is_new_device) = match event {
            CentralEvent::DeviceDiscovered(id) => {
                trace!("Device discovered: {:?}", id);
                (id, true)
            }
            CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => (id, false),
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
                return None;
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                return None;
            }
            _ => return None,
        };

        Self::process_peripheral(adapter, peripherals, id, is_new_device).await
    }

    async fn process_peripheral(
        adapter: &Adapter,
        peripherals: &PeripheralMap,
        id: PeripheralId,
        is_new_device: bool,
    ) -> Option<DiscoveryEvent> {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let address = normalize_address(&properties.address.to_string());
        peripherals.write().insert(address.clone(), peripheral);

        Some(DiscoveryEvent {
            address,
            address_type: properties
                .address_type
                .map(AddressType::from)
                .unwrap_or_default(),
            rssi: properties.rssi.unwrap_or_default(),
            // btleplug does not report the advertising PDU type.
            connectable: true,
            scan_data: scan_data_from_properties(&properties),
            is_new_device,
            is_new_data: true,
        })
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn scan(&self, options: ScanOptions) -> Result<BoxStream<'static, DiscoveryEvent>> {
        if options.passive {
            debug!("Passive scanning is chosen by the platform backend; scanning with defaults");
        }

        info!("Starting BLE scan ({:?})", options.duration);

        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let discoveries = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            async move { Self::process_event(&adapter, &peripherals, event).await }
        });

        match options.duration {
            Some(duration) => {
                let adapter = self.adapter.clone();
                let deadline = async move {
                    tokio::time::sleep(duration).await;
                    if let Err(e) = adapter.stop_scan().await {
                        warn!("Failed to stop scan: {}", e);
                    }
                };
                Ok(discoveries.take_until(Box::pin(deadline)).boxed())
            }
            None => Ok(discoveries.boxed()),
        }
    }

    async fn stop_scan(&self) -> Result<()> {
        info!("Stopping BLE scan");
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect(
        &self,
        address: &str,
        _address_type: AddressType,
    ) -> Result<Box<dyn GattConnection>> {
        let address = normalize_address(address);
        let peripheral = self
            .peripherals
            .read()
            .get(&address)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.clone(),
            })?;

        let connection = BtleplugConnection::connect(address, peripheral).await?;
        Ok(Box::new(connection))
    }
}

/// Rebuild the advertisement entries a scanner would report from the
/// properties btleplug keeps for a peripheral.
pub fn scan_data_from_properties(properties: &PeripheralProperties) -> Vec<ScanDataEntry> {
    let mut entries = Vec::new();

    if let Some(name) = &properties.local_name {
        entries.push(ScanDataEntry::new(AD_TYPE_COMPLETE_LOCAL_NAME, name.clone()));
    }

    if let Some(tx_power) = properties.tx_power_level {
        entries.push(ScanDataEntry::new(
            AD_TYPE_TX_POWER,
            to_hex(&[tx_power as i8 as u8]),
        ));
    }

    let (short, long): (Vec<&uuid::Uuid>, Vec<&uuid::Uuid>) = properties
        .services
        .iter()
        .partition(|uuid| short_uuid(uuid).is_some());
    for (ad_type, uuids) in [
        (AD_TYPE_COMPLETE_16B_SERVICES, short),
        (AD_TYPE_COMPLETE_128B_SERVICES, long),
    ] {
        if !uuids.is_empty() {
            let joined: Vec<String> = uuids.iter().map(|u| u.to_string()).collect();
            entries.push(ScanDataEntry::new(ad_type, joined.join(",")));
        }
    }

    let mut service_data: Vec<_> = properties.service_data.iter().collect();
    service_data.sort_by_key(|(uuid, _)| **uuid);
    for (uuid, data) in service_data {
        if let Some(short) = short_uuid(uuid) {
            let mut value = short.to_le_bytes().to_vec();
            value.extend_from_slice(data);
            entries.push(ScanDataEntry::new(AD_TYPE_SERVICE_16B_DATA, to_hex(&value)));
        }
    }

    let mut manufacturer_data: Vec<_> = properties.manufacturer_data.iter().collect();
    manufacturer_data.sort_by_key(|(id, _)| **id);
    for (id, data) in manufacturer_data {
        let mut value = id.to_le_bytes().to_vec();
        value.extend_from_slice(data);
        entries.push(ScanDataEntry::new(AD_TYPE_MANUFACTURER, to_hex(&value)));
    }

    entries
}

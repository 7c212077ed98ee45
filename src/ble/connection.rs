//! btleplug connection backend.
//!
//! Wraps a connected btleplug peripheral as a [`GattConnection`].

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use crate::ble::adapter::{CharacteristicInfo, GattConnection, ServiceInfo};
use crate::error::{Error, Result};

/// Connection state of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// One service of the attribute table with its characteristics.
struct ServiceEntry {
    info: ServiceInfo,
    characteristics: Vec<(CharacteristicInfo, Characteristic)>,
}

/// btleplug does not expose ATT handles, so handles are assigned in
/// enumeration order: one for each service declaration, then one per
/// characteristic.
fn build_attribute_table(
    services: impl IntoIterator<Item = btleplug::api::Service>,
) -> Vec<ServiceEntry> {
    let mut next_handle: u16 = 1;
    let mut table = Vec::new();

    for service in services {
        let start_handle = next_handle;
        next_handle = next_handle.saturating_add(1);

        let mut characteristics = Vec::new();
        for characteristic in service.characteristics {
            let info = CharacteristicInfo {
                uuid: characteristic.uuid,
                handle: next_handle,
                properties: characteristic.properties,
            };
            next_handle = next_handle.saturating_add(1);
            characteristics.push((info, characteristic));
        }

        table.push(ServiceEntry {
            info: ServiceInfo {
                uuid: service.uuid,
                start_handle,
                end_handle: next_handle - 1,
            },
            characteristics,
        });
    }

    table
}

/// [`GattConnection`] over a btleplug peripheral.
pub struct BtleplugConnection {
    /// Normalized device address.
    address: String,
    /// The connected peripheral.
    peripheral: Peripheral,
    /// Current connection state.
    state: Arc<RwLock<ConnectionState>>,
    /// Attribute table built after service discovery.
    table: Vec<ServiceEntry>,
}

impl BtleplugConnection {
    /// Connect to `peripheral` and discover its services.
    pub async fn connect(address: String, peripheral: Peripheral) -> Result<Self> {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        if !peripheral.is_connected().await.unwrap_or(false) {
            debug!("Connecting to {}", address);
            if let Err(e) = peripheral.connect().await {
                *state.write() = ConnectionState::Disconnected;
                return Err(Error::Bluetooth(e));
            }
        }

        if let Err(e) = peripheral.discover_services().await {
            // Leave the link up only on success.
            if let Err(disconnect_err) = peripheral.disconnect().await {
                debug!("Disconnect from {} failed: {}", address, disconnect_err);
            }
            *state.write() = ConnectionState::Disconnected;
            return Err(Error::Bluetooth(e));
        }

        let table = build_attribute_table(peripheral.services());
        info!("Connected to {} ({} services)", address, table.len());
        *state.write() = ConnectionState::Connected;

        Ok(Self {
            address,
            peripheral,
            state,
            table,
        })
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Fail with [`Error::Disconnected`] if the link has gone away.
    async fn ensure_connected(&self) -> Result<()> {
        if !self.state().is_connected() {
            return Err(Error::NotConnected);
        }
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            *self.state.write() = ConnectionState::Disconnected;
            return Err(Error::Disconnected {
                address: self.address.clone(),
                reason: "peripheral reports no connection".to_string(),
            });
        }
        Ok(())
    }

    fn characteristic(&self, handle: u16) -> Result<&Characteristic> {
        self.table
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|(info, _)| info.handle == handle)
            .map(|(_, c)| c)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: format!("handle {:#06x}", handle),
            })
    }
}

#[async_trait]
impl GattConnection for BtleplugConnection {
    async fn services(&self) -> Result<Vec<ServiceInfo>> {
        self.ensure_connected().await?;
        Ok(self.table.iter().map(|s| s.info).collect())
    }

    async fn characteristics(&self, service: &ServiceInfo) -> Result<Vec<CharacteristicInfo>> {
        self.ensure_connected().await?;
        let entry = self
            .table
            .iter()
            .find(|s| s.info.start_handle == service.start_handle)
            .ok_or_else(|| Error::InvalidParameter {
                name: "service".to_string(),
                value: service.uuid.to_string(),
            })?;
        Ok(entry.characteristics.iter().map(|(info, _)| *info).collect())
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        self.ensure_connected().await?;
        let characteristic = self.characteristic(handle)?;
        let data = self
            .peripheral
            .read(characteristic)
            .await
            .map_err(Error::Bluetooth)?;
        trace!("Read {} bytes from {}", data.len(), characteristic.uuid);
        Ok(data)
    }

    async fn write(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
        self.ensure_connected().await?;
        let characteristic = self.characteristic(handle)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(Error::Bluetooth)?;
        trace!("Wrote {} bytes to {}", data.len(), characteristic.uuid);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if matches!(self.state(), ConnectionState::Disconnected) {
            return Ok(());
        }

        *self.state.write() = ConnectionState::Disconnecting;

        let result = self.peripheral.disconnect().await;
        *self.state.write() = ConnectionState::Disconnected;

        match result {
            Ok(()) => {
                debug!("Disconnected from {}", self.address);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect from {}: {}", self.address, e);
                Err(Error::Bluetooth(e))
            }
        }
    }
}

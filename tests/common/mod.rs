//! In-memory adapter for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use ble_scan_kit::{
    AddressType, BleAdapter, CharacteristicInfo, DiscoveryEvent, Error, GattConnection, Operation,
    Result, ScanOptions, ServiceInfo,
};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Attribute table served by [`FakeConnection`].
#[derive(Debug, Clone, Default)]
pub struct FakeDevice {
    pub services: Vec<(ServiceInfo, Vec<CharacteristicInfo>)>,
    pub values: HashMap<u16, Vec<u8>>,
}

/// Replays discovery events and serves connections from [`FakeDevice`] tables.
#[derive(Default)]
pub struct FakeAdapter {
    events: Mutex<Vec<DiscoveryEvent>>,
    devices: Mutex<HashMap<String, FakeDevice>>,
    writes: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
    connects: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
}

impl FakeAdapter {
    pub fn new(events: Vec<DiscoveryEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    pub fn with_device(self, address: &str, device: FakeDevice) -> Self {
        self.devices.lock().insert(address.to_ascii_lowercase(), device);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    async fn scan(&self, _options: ScanOptions) -> Result<BoxStream<'static, DiscoveryEvent>> {
        let events = std::mem::take(&mut *self.events.lock());
        Ok(stream::iter(events).boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(
        &self,
        address: &str,
        _address_type: AddressType,
    ) -> Result<Box<dyn GattConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let device = self
            .devices
            .lock()
            .get(&address.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::Transient {
                operation: Operation::Connect,
                reason: "no answer".to_string(),
            })?;

        Ok(Box::new(FakeConnection {
            device,
            writes: self.writes.clone(),
            disconnects: self.disconnects.clone(),
        }))
    }
}

struct FakeConnection {
    device: FakeDevice,
    writes: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl GattConnection for FakeConnection {
    async fn services(&self) -> Result<Vec<ServiceInfo>> {
        Ok(self.device.services.iter().map(|(s, _)| *s).collect())
    }

    async fn characteristics(&self, service: &ServiceInfo) -> Result<Vec<CharacteristicInfo>> {
        Ok(self
            .device
            .services
            .iter()
            .find(|(s, _)| s.start_handle == service.start_handle)
            .map(|(_, c)| c.clone())
            .unwrap_or_default())
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        self.device
            .values
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::Transient {
                operation: Operation::Read,
                reason: format!("handle {handle} not readable"),
            })
    }

    async fn write(&self, handle: u16, data: &[u8], _with_response: bool) -> Result<()> {
        self.writes.lock().push((handle, data.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

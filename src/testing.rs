//! Scripted adapter shared by the unit tests.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ble::adapter::{AddressType, BleAdapter, DiscoveryEvent, GattConnection, ScanOptions};
use crate::error::{Error, Operation, Result};

/// Replays a fixed list of discovery events and hands out queued connections.
pub(crate) struct ScriptedAdapter {
    events: Mutex<Vec<DiscoveryEvent>>,
    connections: Mutex<VecDeque<Box<dyn GattConnection>>>,
    scans: Mutex<Vec<ScanOptions>>,
    connect_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    hold_open: bool,
}

impl ScriptedAdapter {
    pub(crate) fn new(events: Vec<DiscoveryEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            connections: Mutex::new(VecDeque::new()),
            scans: Mutex::new(Vec::new()),
            connect_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            hold_open: false,
        }
    }

    /// Queue a connection for the next `connect` call.
    pub(crate) fn with_connection(self, conn: impl GattConnection + 'static) -> Self {
        self.connections.lock().push_back(Box::new(conn));
        self
    }

    /// Keep the event stream open after the last event, like a continuous scan.
    pub(crate) fn holding_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn scans(&self) -> Vec<ScanOptions> {
        self.scans.lock().clone()
    }
}

#[async_trait]
impl BleAdapter for ScriptedAdapter {
    async fn scan(&self, options: ScanOptions) -> Result<BoxStream<'static, DiscoveryEvent>> {
        self.scans.lock().push(options);
        let events = stream::iter(std::mem::take(&mut *self.events.lock()));
        if self.hold_open {
            Ok(events.chain(stream::pending()).boxed())
        } else {
            Ok(events.boxed())
        }
    }

    async fn stop_scan(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(
        &self,
        address: &str,
        _address_type: AddressType,
    ) -> Result<Box<dyn GattConnection>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.connections
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Transient {
                operation: Operation::Connect,
                reason: format!("{} did not answer", address),
            })
    }
}

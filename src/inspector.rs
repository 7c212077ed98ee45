//! GATT inspection of a discovered device.
//!
//! [`GattInspector`] connects to a device under a retry budget, walks its
//! services in ascending handle order, enumerates characteristics and reads
//! every readable value. The connection is released on every exit path.

use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use btleplug::api::CharPropFlags;

use crate::ble::adapter::{
    properties_to_string, BleAdapter, CharacteristicInfo, GattConnection, ServiceInfo,
};
use crate::ble::uuids::{DEVICE_INFORMATION_UUID, DEVICE_NAME_UUID};
use crate::error::{Error, ErrorKind, Operation, Result};
use crate::registry::DiscoveredDevice;
use crate::retry::{RetryBudget, RetryPolicy};
use crate::utils::{to_escaped_ascii, to_hex_pairs};

/// Retry budgets for the three inspection steps.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InspectionBudgets {
    /// Connecting and walking the attribute table. A failure anywhere in the
    /// walk, including a disconnect or an exhausted step, restarts the
    /// connection.
    pub connect: RetryBudget,
    /// Enumerating the characteristics of one service.
    pub characteristics: RetryBudget,
    /// Reading one characteristic.
    pub read: RetryBudget,
}

impl Default for InspectionBudgets {
    fn default() -> Self {
        Self {
            connect: RetryBudget::new(3, Duration::ZERO).retry_all(),
            characteristics: RetryBudget::default(),
            read: RetryBudget::default(),
        }
    }
}

impl InspectionBudgets {
    /// Budgets that never connect.
    pub fn disabled() -> Self {
        Self {
            connect: RetryBudget::disabled(),
            characteristics: RetryBudget::disabled(),
            read: RetryBudget::disabled(),
        }
    }

    /// Budgets with the given attempt counts and default backoffs.
    ///
    /// A count of zero disables that step.
    pub fn with_attempts(connect: u32, characteristics: u32, read: u32) -> Self {
        let defaults = Self::default();
        Self {
            connect: RetryBudget {
                max_attempts: connect,
                ..defaults.connect
            },
            characteristics: RetryBudget {
                max_attempts: characteristics,
                ..defaults.characteristics
            },
            read: RetryBudget {
                max_attempts: read,
                ..defaults.read
            },
        }
    }
}

/// A characteristic found during inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicRecord {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Value handle.
    pub handle: u16,
    /// Property flags.
    pub properties: CharPropFlags,
    /// Value read, for readable characteristics.
    pub value: Option<Vec<u8>>,
}

impl CharacteristicRecord {
    fn new(info: CharacteristicInfo) -> Self {
        Self {
            uuid: info.uuid,
            handle: info.handle,
            properties: info.properties,
            value: None,
        }
    }

    /// The value rendered for display, if one was read.
    pub fn formatted_value(&self) -> Option<String> {
        self.value.as_deref().map(|v| format_value(&self.uuid, v))
    }
}

/// A service found during inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceRecord {
    /// Service UUID.
    pub uuid: Uuid,
    /// First handle of the service.
    pub start_handle: u16,
    /// Last handle of the service.
    pub end_handle: u16,
    /// Characteristics in the order the device reported them.
    pub characteristics: Vec<CharacteristicRecord>,
}

impl ServiceRecord {
    fn new(info: ServiceInfo) -> Self {
        Self {
            uuid: info.uuid,
            start_handle: info.start_handle,
            end_handle: info.end_handle,
            characteristics: Vec::new(),
        }
    }
}

/// Result of inspecting one device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InspectionReport {
    /// Address of the inspected device.
    pub address: String,
    /// Services by ascending start handle.
    pub services: Vec<ServiceRecord>,
}

impl InspectionReport {
    /// Report for a device that was not connected to.
    pub fn empty(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            services: Vec::new(),
        }
    }

    /// Check if no services were recorded.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Find a characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicRecord> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == *uuid)
    }

    /// Textual dump, one line per service, characteristic and value.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for service in &self.services {
            lines.push(format!(
                "Service {}, start handle {:#06x}",
                service.uuid, service.start_handle
            ));
            for chara in &service.characteristics {
                lines.push(format!(
                    "    Characteristic {}, handle {:#06x}, Properties: {}",
                    chara.uuid,
                    chara.handle,
                    properties_to_string(chara.properties)
                ));
                if let Some(value) = chara.formatted_value() {
                    lines.push(format!("        {}", value));
                }
            }
        }
        lines
    }
}

impl std::fmt::Display for InspectionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.lines().join("\n"))
    }
}

/// Render a characteristic value.
///
/// The device name is shown as quoted text, device information as an
/// escaped dump between bars, anything else as its escaped form followed by
/// hex pairs.
pub fn format_value(uuid: &Uuid, value: &[u8]) -> String {
    if *uuid == DEVICE_NAME_UUID {
        format!("\"{}\"", String::from_utf8_lossy(value))
    } else if *uuid == DEVICE_INFORMATION_UUID {
        format!("|{}|", to_escaped_ascii(value))
    } else {
        format!("{} <{}>", to_escaped_ascii(value), to_hex_pairs(value))
    }
}

/// Connects to devices and dumps their attribute tables.
#[derive(Debug, Clone)]
pub struct GattInspector {
    budgets: InspectionBudgets,
    span: Span,
}

impl Default for GattInspector {
    fn default() -> Self {
        Self::new(InspectionBudgets::default())
    }
}

impl GattInspector {
    /// Create an inspector logging under a `gatt_inspector` span.
    pub fn new(budgets: InspectionBudgets) -> Self {
        Self::with_span(budgets, info_span!("gatt_inspector"))
    }

    /// Create an inspector logging under `span`.
    pub fn with_span(budgets: InspectionBudgets, span: Span) -> Self {
        Self { budgets, span }
    }

    /// An inspector that never connects.
    pub fn disabled() -> Self {
        Self::new(InspectionBudgets::disabled())
    }

    /// The budgets in use.
    pub fn budgets(&self) -> &InspectionBudgets {
        &self.budgets
    }

    /// Check if the inspector will ever connect.
    pub fn is_enabled(&self) -> bool {
        self.budgets.connect.is_enabled()
    }

    /// Inspect `device`.
    ///
    /// A device that is not connectable, or a disabled connect budget, yields
    /// an empty report without touching the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetryExhausted`] when no connection attempt got
    /// through the walk, or the underlying error when it is fatal under the
    /// connect budget. An exhausted characteristic enumeration or read fails
    /// the attempt it happened in.
    pub async fn inspect(
        &self,
        adapter: &dyn BleAdapter,
        device: &DiscoveredDevice,
    ) -> Result<InspectionReport> {
        if !device.connectable || !self.is_enabled() {
            debug!(parent: &self.span, "Skipping inspection of {}", device.address);
            return Ok(InspectionReport::empty(&device.address));
        }

        let policy = RetryPolicy::new(Operation::Connect, self.budgets.connect.clone());

        async {
            info!("Connecting to {}", device.address);
            let report = policy
                .execute(move |_| async move {
                    let conn = adapter.connect(&device.address, device.address_type).await?;
                    let result = self.walk(conn.as_ref(), &device.address).await;
                    release(conn.as_ref(), &device.address).await;
                    result
                })
                .await?;
            info!(
                "Inspected {}: {} services",
                device.address,
                report.services.len()
            );
            Ok::<_, Error>(report)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Write `data` to the first characteristic with `uuid` on `device`.
    ///
    /// Connects under the connect budget and always disconnects afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CharacteristicNotFound`] if no service exposes the
    /// characteristic, or the connect/write failure once the budget is spent.
    pub async fn write_characteristic(
        &self,
        adapter: &dyn BleAdapter,
        device: &DiscoveredDevice,
        uuid: &Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        if !device.connectable {
            return Err(Error::InvalidParameter {
                name: "device".to_string(),
                value: format!("{} is not connectable", device.address),
            });
        }

        let mut budget = self.budgets.connect.clone();
        if !budget.is_enabled() {
            budget.max_attempts = 1;
        }
        budget.fatal_on.insert(ErrorKind::Usage);
        let policy = RetryPolicy::new(Operation::Write, budget);

        async {
            policy
                .execute(move |_| async move {
                    let conn = adapter.connect(&device.address, device.address_type).await?;
                    let result = write_by_uuid(conn.as_ref(), uuid, data, with_response).await;
                    release(conn.as_ref(), &device.address).await;
                    result
                })
                .await?;
            info!("Wrote {} bytes to {} on {}", data.len(), uuid, device.address);
            Ok::<_, Error>(())
        }
        .instrument(self.span.clone())
        .await
    }

    async fn walk(&self, conn: &dyn GattConnection, address: &str) -> Result<InspectionReport> {
        let mut services = conn.services().await?;
        services.sort_by_key(|s| s.start_handle);

        let mut report = InspectionReport::empty(address);
        for service in services {
            let mut record = ServiceRecord::new(service);
            if self.budgets.characteristics.is_enabled() {
                self.walk_service(conn, &service, &mut record).await?;
            }
            report.services.push(record);
        }
        Ok(report)
    }

    async fn walk_service(
        &self,
        conn: &dyn GattConnection,
        service: &ServiceInfo,
        record: &mut ServiceRecord,
    ) -> Result<()> {
        debug!("Service {} ({:#06x})", service.uuid, service.start_handle);

        let policy = RetryPolicy::new(Operation::Characteristics, self.budgets.characteristics.clone());
        let characteristics = policy
            .execute(move |_| conn.characteristics(service))
            .await
            .map_err(|e| {
                if !e.is_fatal() {
                    warn!("Service {}: ({}: failed)", service.uuid, Operation::Characteristics);
                }
                Error::from(e)
            })?;

        let read_policy = RetryPolicy::new(Operation::Read, self.budgets.read.clone());
        for info in characteristics {
            let mut chara = CharacteristicRecord::new(info);

            if info.properties.contains(CharPropFlags::READ) && self.budgets.read.is_enabled() {
                let handle = info.handle;
                let value = read_policy
                    .execute(move |_| conn.read(handle))
                    .await
                    .map_err(|e| {
                        if !e.is_fatal() {
                            warn!("Characteristic {}: ({}: failed)", info.uuid, Operation::Read);
                        }
                        Error::from(e)
                    })?;
                chara.value = Some(value);
            }

            record.characteristics.push(chara);
        }
        Ok(())
    }
}

async fn write_by_uuid(
    conn: &dyn GattConnection,
    uuid: &Uuid,
    data: &[u8],
    with_response: bool,
) -> Result<()> {
    let mut services = conn.services().await?;
    services.sort_by_key(|s| s.start_handle);

    for service in &services {
        let characteristics = conn.characteristics(service).await?;
        if let Some(chara) = characteristics.iter().find(|c| c.uuid == *uuid) {
            return conn.write(chara.handle, data, with_response).await;
        }
    }

    Err(Error::CharacteristicNotFound {
        uuid: uuid.to_string(),
    })
}

async fn release(conn: &dyn GattConnection, address: &str) {
    if let Err(e) = conn.disconnect().await {
        debug!("Disconnect from {} failed: {}", address, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::{DiscoveryEvent, MockGattConnection};
    use crate::ble::uuids::uuid_from_u16;
    use crate::testing::ScriptedAdapter;
    use pretty_assertions::assert_eq;

    fn device(connectable: bool) -> DiscoveredDevice {
        DiscoveredDevice::from_event(
            &DiscoveryEvent::new_device("aa:bb:cc:dd:ee:01", vec![]).with_connectable(connectable),
        )
    }

    fn service(short: u16, start_handle: u16) -> ServiceInfo {
        ServiceInfo {
            uuid: uuid_from_u16(short),
            start_handle,
            end_handle: start_handle + 1,
        }
    }

    fn chara(short: u16, handle: u16, properties: CharPropFlags) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: uuid_from_u16(short),
            handle,
            properties,
        }
    }

    fn fast_budgets() -> InspectionBudgets {
        let mut budgets = InspectionBudgets::default();
        budgets.characteristics.backoff = Duration::from_millis(10);
        budgets.read.backoff = Duration::from_millis(10);
        budgets
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_sorted_by_handle() {
        let mut conn = MockGattConnection::new();
        conn.expect_services()
            .returning(|| Ok(vec![service(0x1801, 40), service(0x1800, 10), service(0x180f, 25)]));
        conn.expect_characteristics().returning(|_| Ok(vec![]));
        conn.expect_disconnect().times(1).returning(|| Ok(()));

        let adapter = ScriptedAdapter::new(vec![]).with_connection(conn);
        let report = GattInspector::new(fast_budgets())
            .inspect(&adapter, &device(true))
            .await
            .unwrap();

        let handles: Vec<u16> = report.services.iter().map(|s| s.start_handle).collect();
        assert_eq!(handles, vec![10, 25, 40]);
        assert_eq!(adapter.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_only_readable_characteristics() {
        let mut conn = MockGattConnection::new();
        conn.expect_services().returning(|| Ok(vec![service(0x1800, 1)]));
        conn.expect_characteristics().returning(|_| {
            Ok(vec![
                chara(0x2a00, 3, CharPropFlags::READ),
                chara(0x2a05, 5, CharPropFlags::INDICATE),
            ])
        });
        conn.expect_read()
            .withf(|handle| *handle == 3)
            .times(1)
            .returning(|_| Ok(b"MM-BLEBC2".to_vec()));
        conn.expect_disconnect().times(1).returning(|| Ok(()));

        let adapter = ScriptedAdapter::new(vec![]).with_connection(conn);
        let report = GattInspector::new(fast_budgets())
            .inspect(&adapter, &device(true))
            .await
            .unwrap();

        let name = report.characteristic(&DEVICE_NAME_UUID).unwrap();
        assert_eq!(name.formatted_value().as_deref(), Some("\"MM-BLEBC2\""));
        assert_eq!(report.services[0].characteristics[1].value, None);
        assert_eq!(
            report.lines(),
            vec![
                "Service 00001800-0000-1000-8000-00805f9b34fb, start handle 0x0001".to_string(),
                "    Characteristic 00002a00-0000-1000-8000-00805f9b34fb, handle 0x0003, Properties: READ"
                    .to_string(),
                "        \"MM-BLEBC2\"".to_string(),
                "    Characteristic 00002a05-0000-1000-8000-00805f9b34fb, handle 0x0005, Properties: INDICATE"
                    .to_string(),
            ]
        );
    }

    fn failing_reader() -> MockGattConnection {
        let mut conn = MockGattConnection::new();
        conn.expect_services().returning(|| Ok(vec![service(0x180f, 1)]));
        conn.expect_characteristics()
            .returning(|_| Ok(vec![chara(0x2a19, 2, CharPropFlags::READ)]));
        conn.expect_read().times(3).returning(|_| {
            Err(Error::Transient {
                operation: Operation::Read,
                reason: "ATT timeout".to_string(),
            })
        });
        conn.expect_disconnect().times(1).returning(|| Ok(()));
        conn
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_read_restarts_connection() {
        let adapter = ScriptedAdapter::new(vec![])
            .with_connection(failing_reader())
            .with_connection(failing_reader())
            .with_connection(failing_reader());
        let err = GattInspector::new(fast_budgets())
            .inspect(&adapter, &device(true))
            .await
            .unwrap_err();

        assert_eq!(adapter.connect_calls(), 3);
        match err {
            Error::RetryExhausted {
                operation: Operation::Connect,
                attempts: 3,
                last_error,
            } => assert!(matches!(
                *last_error,
                Error::RetryExhausted {
                    operation: Operation::Read,
                    attempts: 3,
                    ..
                }
            )),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_enumeration_fails_attempt() {
        let mut flaky = MockGattConnection::new();
        flaky.expect_services().returning(|| Ok(vec![service(0x1800, 1)]));
        flaky.expect_characteristics().times(3).returning(|_| {
            Err(Error::Transient {
                operation: Operation::Characteristics,
                reason: "ATT timeout".to_string(),
            })
        });
        flaky.expect_disconnect().times(1).returning(|| Ok(()));

        let mut healthy = MockGattConnection::new();
        healthy.expect_services().returning(|| Ok(vec![service(0x1800, 1)]));
        healthy.expect_characteristics().returning(|_| Ok(vec![]));
        healthy.expect_disconnect().times(1).returning(|| Ok(()));

        let adapter = ScriptedAdapter::new(vec![])
            .with_connection(flaky)
            .with_connection(healthy);
        let report = GattInspector::new(fast_budgets())
            .inspect(&adapter, &device(true))
            .await
            .unwrap();

        assert_eq!(adapter.connect_calls(), 2);
        assert_eq!(report.services.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_walk_restarts_connection() {
        let mut broken = MockGattConnection::new();
        broken.expect_services().returning(|| Ok(vec![service(0x1800, 1)]));
        broken.expect_characteristics().times(1).returning(|_| {
            Err(Error::Disconnected {
                address: "aa:bb:cc:dd:ee:01".to_string(),
                reason: "link lost".to_string(),
            })
        });
        broken.expect_disconnect().times(1).returning(|| Ok(()));

        let mut healthy = MockGattConnection::new();
        healthy.expect_services().returning(|| Ok(vec![service(0x1800, 1)]));
        healthy.expect_characteristics().returning(|_| Ok(vec![]));
        healthy.expect_disconnect().times(1).returning(|| Ok(()));

        let adapter = ScriptedAdapter::new(vec![])
            .with_connection(broken)
            .with_connection(healthy);
        let report = GattInspector::new(fast_budgets())
            .inspect(&adapter, &device(true))
            .await
            .unwrap();

        assert_eq!(adapter.connect_calls(), 2);
        assert_eq!(report.services.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_under_strict_connect_budget_propagates() {
        let mut conn = MockGattConnection::new();
        conn.expect_services().returning(|| {
            Err(Error::Disconnected {
                address: "aa:bb:cc:dd:ee:01".to_string(),
                reason: "link lost".to_string(),
            })
        });
        conn.expect_disconnect().times(1).returning(|| Ok(()));

        let mut budgets = fast_budgets();
        budgets.connect = RetryBudget::new(3, Duration::ZERO);

        let adapter = ScriptedAdapter::new(vec![]).with_connection(conn);
        let err = GattInspector::new(budgets)
            .inspect(&adapter, &device(true))
            .await
            .unwrap_err();

        assert!(err.is_disconnect());
        assert_eq!(adapter.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_non_connectable_device_is_skipped() {
        let adapter = ScriptedAdapter::new(vec![]);
        let report = GattInspector::new(fast_budgets())
            .inspect(&adapter, &device(false))
            .await
            .unwrap();

        assert!(report.is_empty());
        assert_eq!(adapter.connect_calls(), 0);

        let report = GattInspector::disabled()
            .inspect(&adapter, &device(true))
            .await
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(adapter.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausted() {
        let adapter = ScriptedAdapter::new(vec![]);
        let err = GattInspector::new(fast_budgets())
            .inspect(&adapter, &device(true))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::RetryExhausted {
                operation: Operation::Connect,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(adapter.connect_calls(), 3);
    }

    #[tokio::test]
    async fn test_write_characteristic() {
        let mut conn = MockGattConnection::new();
        conn.expect_services()
            .returning(|| Ok(vec![service(0x180f, 8), service(0xffe0, 1)]));
        conn.expect_characteristics().returning(|s| {
            if s.start_handle == 1 {
                Ok(vec![chara(0xffe1, 2, CharPropFlags::WRITE)])
            } else {
                Ok(vec![])
            }
        });
        conn.expect_write()
            .withf(|handle, data, with_response| *handle == 2 && data.to_vec() == b"on" && *with_response)
            .times(1)
            .returning(|_, _, _| Ok(()));
        conn.expect_disconnect().times(1).returning(|| Ok(()));

        let adapter = ScriptedAdapter::new(vec![]).with_connection(conn);
        GattInspector::new(fast_budgets())
            .write_characteristic(&adapter, &device(true), &uuid_from_u16(0xffe1), b"on", true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_missing_characteristic_is_not_retried() {
        let mut conn = MockGattConnection::new();
        conn.expect_services().returning(|| Ok(vec![service(0x180f, 1)]));
        conn.expect_characteristics().returning(|_| Ok(vec![]));
        conn.expect_disconnect().times(1).returning(|| Ok(()));

        let adapter = ScriptedAdapter::new(vec![]).with_connection(conn);
        let err = GattInspector::new(fast_budgets())
            .write_characteristic(&adapter, &device(true), &uuid_from_u16(0xffe1), b"on", false)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CharacteristicNotFound { .. }));
        assert_eq!(adapter.connect_calls(), 1);
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&DEVICE_NAME_UUID, b"beacon"), "\"beacon\"");
        assert_eq!(format_value(&DEVICE_INFORMATION_UUID, b"v1\x00"), "|b'v1\\x00'|");
        assert_eq!(
            format_value(&uuid_from_u16(0x2a19), &[0x64, 0x41]),
            "b'dA' <64 41>"
        );
    }
}

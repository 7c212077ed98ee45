// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-scan-kit
//!
//! Bluetooth Low Energy discovery with bounded-retry GATT inspection and
//! environmental beacon decoding.
//!
//! ## Features
//!
//! - **Discovery**: classify advertisements as new, updated or filtered and
//!   keep the devices of a scan window in discovery order
//! - **Allow-lists**: filter by address, advertised service UUID or local name
//! - **GATT inspection**: connect, walk services by handle and read every
//!   readable characteristic, each step under its own retry budget
//! - **Beacon readings**: decode battery, temperature and humidity from
//!   16-bit service data and average them over the last N samples
//! - **Pluggable radio**: everything runs against the [`BleAdapter`] trait;
//!   [`BtleplugAdapter`] drives the system adapter
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_scan_kit::{BeaconApp, BeaconConfig, BtleplugAdapter, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let adapter = Arc::new(BtleplugAdapter::new().await?);
//!     let mut app = BeaconApp::new(adapter, BeaconConfig::default().with_history_size(5));
//!
//!     app.run(&mut |battery: f64, temperature: f64, humidity: f64| {
//!         println!("{battery:.0} % {temperature:.1} 'C {humidity:.1} %");
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### macOS
//! Requires Bluetooth permission for the terminal or bundled app.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and report types

pub mod beacon;
pub mod ble;
pub mod data;
pub mod error;
pub mod inspector;
pub mod registry;
pub mod retry;
pub mod session;
pub mod utils;

#[cfg(test)]
mod testing;

pub use beacon::{BeaconApp, BeaconConfig, ReadingSink};
pub use ble::{
    AddressType, BleAdapter, BtleplugAdapter, CharPropFlags, CharacteristicInfo, DiscoveryEvent,
    GattConnection, ScanDataEntry, ScanOptions, ServiceInfo,
};
pub use data::{decode_sensor_payload, ReadingHistory, SensorReading, TrailingHistory};
pub use error::{DecodeError, Error, ErrorKind, Operation, Result};
pub use inspector::{
    CharacteristicRecord, GattInspector, InspectionBudgets, InspectionReport, ServiceRecord,
};
pub use registry::{DeviceFilter, DeviceRegistry, DiscoveredDevice, DiscoveryClass};
pub use retry::{RetryBudget, RetryError, RetryPolicy};
pub use session::{
    Discovery, DiscoveryHandler, ScanConfig, ScanOutcome, ScanSession, SessionState, StopHandle,
};

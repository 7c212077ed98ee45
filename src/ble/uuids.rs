//! BLE service and characteristic UUIDs.
//!
//! Assigned numbers used by the inspector's value formatting and the
//! environmental beacon decoder.

use uuid::Uuid;

const BASE_VALUE: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// The Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(BASE_VALUE);

/// Generic Access "Device Name" characteristic.
pub const DEVICE_NAME_UUID: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_00805f9b34fb);

/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFORMATION_UUID: Uuid = Uuid::from_u128(0x0000_180a_0000_1000_8000_00805f9b34fb);

/// Service advertised by MM-BLEBC2 environmental beacons.
pub const ENV_BEACON_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);

const BASE_MASK: u128 = 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff;

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_VALUE | ((short as u128) << 96))
}

/// Recover the 16-bit form of a UUID built on the Bluetooth base UUID.
///
/// Returns `None` for vendor (128-bit) UUIDs.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let high = value >> 96;
    if value & BASE_MASK == BASE_VALUE && high <= u16::MAX as u128 {
        Some(high as u16)
    } else {
        None
    }
}

//! Advertising data parsing.
//!
//! Turns the `(type, description, value)` triples an adapter reports for an
//! advertisement into typed [`AdvertisementField`]s, and converts between
//! fields and their on-air `[length][type][payload]` form.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;
use uuid::Uuid;

use crate::ble::uuids::{short_uuid, uuid_from_u16};
use crate::error::DecodeError;
use crate::utils::{parse_hex, to_hex};

/// AD type: flags.
pub const AD_TYPE_FLAGS: u8 = 0x01;
/// AD type: incomplete list of 16-bit service UUIDs.
pub const AD_TYPE_INCOMPLETE_16B_SERVICES: u8 = 0x02;
/// AD type: complete list of 16-bit service UUIDs.
pub const AD_TYPE_COMPLETE_16B_SERVICES: u8 = 0x03;
/// AD type: complete list of 128-bit service UUIDs.
pub const AD_TYPE_COMPLETE_128B_SERVICES: u8 = 0x07;
/// AD type: shortened local name.
pub const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
/// AD type: complete local name.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// AD type: TX power level.
pub const AD_TYPE_TX_POWER: u8 = 0x0a;
/// AD type: service data with a 16-bit UUID.
pub const AD_TYPE_SERVICE_16B_DATA: u8 = 0x16;
/// AD type: manufacturer specific data.
pub const AD_TYPE_MANUFACTURER: u8 = 0xff;

/// Human readable name of an AD type, as scanners print it.
pub fn describe_ad_type(ad_type: u8) -> &'static str {
    match ad_type {
        0x01 => "Flags",
        0x02 => "Incomplete 16b Services",
        0x03 => "Complete 16b Services",
        0x04 => "Incomplete 32b Services",
        0x05 => "Complete 32b Services",
        0x06 => "Incomplete 128b Services",
        0x07 => "Complete 128b Services",
        0x08 => "Short Local Name",
        0x09 => "Complete Local Name",
        0x0a => "Tx Power",
        0x16 => "16b Service Data",
        0xff => "Manufacturer",
        _ => "Unknown",
    }
}

/// One entry of an adapter's scan data: `(type code, description, value)`.
///
/// Values are text: names verbatim, UUID lists comma separated, everything
/// else lower-case hex.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanDataEntry {
    /// AD type code.
    pub ad_type: u8,
    /// Description of the type code.
    pub description: String,
    /// Value text.
    pub value: String,
}

impl ScanDataEntry {
    /// Build an entry, filling in the standard description for `ad_type`.
    pub fn new(ad_type: u8, value: impl Into<String>) -> Self {
        Self {
            ad_type,
            description: describe_ad_type(ad_type).to_string(),
            value: value.into(),
        }
    }
}

/// Kind of an advertisement field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldKind {
    /// Discoverability flags.
    Flags,
    /// Shortened local name.
    ShortLocalName,
    /// Complete local name.
    CompleteLocalName,
    /// Manufacturer specific data.
    ManufacturerData,
    /// Complete list of 16-bit service UUIDs.
    Complete16bServiceUuid,
    /// Service data for a 16-bit service UUID.
    Service16bData,
    /// Anything else.
    Other,
}

impl FieldKind {
    /// Create from an AD type code.
    pub fn from_raw(ad_type: u8) -> Self {
        match ad_type {
            AD_TYPE_FLAGS => Self::Flags,
            AD_TYPE_SHORT_LOCAL_NAME => Self::ShortLocalName,
            AD_TYPE_COMPLETE_LOCAL_NAME => Self::CompleteLocalName,
            AD_TYPE_MANUFACTURER => Self::ManufacturerData,
            AD_TYPE_COMPLETE_16B_SERVICES => Self::Complete16bServiceUuid,
            AD_TYPE_SERVICE_16B_DATA => Self::Service16bData,
            _ => Self::Other,
        }
    }

    /// Check if this kind carries a local name.
    pub fn is_local_name(&self) -> bool {
        matches!(self, Self::ShortLocalName | Self::CompleteLocalName)
    }
}

/// Decoded value of an advertisement field.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldValue {
    /// UTF-8 text, or a value that could not be decoded further.
    Text(String),
    /// A list of service UUIDs.
    Uuids(Vec<Uuid>),
    /// Raw payload bytes.
    Bytes(Vec<u8>),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{}", text),
            Self::Uuids(uuids) => {
                let joined: Vec<String> = uuids.iter().map(Uuid::to_string).collect();
                write!(f, "{}", joined.join(","))
            }
            Self::Bytes(data) => write!(f, "{}", to_hex(data)),
        }
    }
}

/// One decoded element of an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementField {
    /// AD type code.
    pub ad_type: u8,
    /// Kind derived from the type code.
    pub kind: FieldKind,
    /// Decoded value.
    pub value: FieldValue,
}

impl AdvertisementField {
    /// Build a field from its parts.
    pub fn new(ad_type: u8, value: FieldValue) -> Self {
        Self {
            ad_type,
            kind: FieldKind::from_raw(ad_type),
            value,
        }
    }

    /// Decode one scan data triple.
    ///
    /// Values that cannot be parsed for their type are kept as
    /// [`FieldValue::Text`] rather than rejected.
    pub fn from_entry(entry: &ScanDataEntry) -> Self {
        let value = match entry.ad_type {
            AD_TYPE_SHORT_LOCAL_NAME | AD_TYPE_COMPLETE_LOCAL_NAME => {
                FieldValue::Text(entry.value.clone())
            }
            0x02..=0x07 => parse_uuid_list(&entry.value)
                .map(FieldValue::Uuids)
                .unwrap_or_else(|| FieldValue::Text(entry.value.clone())),
            _ => match parse_hex(&entry.value) {
                Ok(data) => FieldValue::Bytes(data),
                Err(e) => {
                    trace!("Keeping {} as text: {}", entry.description, e);
                    FieldValue::Text(entry.value.clone())
                }
            },
        };
        Self::new(entry.ad_type, value)
    }

    /// Build the on-air form `[length][type][payload]` of this field.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::PayloadTooLarge`] if the payload exceeds 254 bytes.
    pub fn encode(&self) -> Result<Bytes, DecodeError> {
        let payload = self.payload();
        if payload.len() > u8::MAX as usize - 1 {
            return Err(DecodeError::PayloadTooLarge { len: payload.len() });
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 2);
        buf.put_u8(payload.len() as u8 + 1);
        buf.put_u8(self.ad_type);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn payload(&self) -> Vec<u8> {
        match &self.value {
            FieldValue::Text(text) => text.as_bytes().to_vec(),
            FieldValue::Bytes(data) => data.clone(),
            FieldValue::Uuids(uuids) => {
                let mut out = Vec::new();
                for uuid in uuids {
                    match short_uuid(uuid) {
                        Some(short) => out.extend_from_slice(&short.to_le_bytes()),
                        None => out.extend_from_slice(&uuid.as_u128().to_le_bytes()),
                    }
                }
                out
            }
        }
    }
}

fn parse_uuid_list(value: &str) -> Option<Vec<Uuid>> {
    value
        .split(',')
        .map(|part| Uuid::parse_str(part.trim()).ok())
        .collect()
}

/// Decode scan data triples into fields, preserving their order.
pub fn decode(entries: &[ScanDataEntry]) -> Vec<AdvertisementField> {
    entries.iter().map(AdvertisementField::from_entry).collect()
}

/// First local name (short or complete) among `fields`.
pub fn extract_local_name(fields: &[AdvertisementField]) -> Option<String> {
    fields
        .iter()
        .find(|f| f.kind.is_local_name())
        .map(|f| f.value.to_string())
}

/// Check whether `fields` advertise `service` in a complete 16-bit UUID list.
pub fn advertises_service(fields: &[AdvertisementField], service: &Uuid) -> bool {
    fields.iter().any(|f| {
        f.kind == FieldKind::Complete16bServiceUuid
            && matches!(&f.value, FieldValue::Uuids(uuids) if uuids.contains(service))
    })
}

/// Payload of the first 16-bit service data field, if any.
pub fn service_data(fields: &[AdvertisementField]) -> Option<&[u8]> {
    fields.iter().find_map(|f| match (&f.kind, &f.value) {
        (FieldKind::Service16bData, FieldValue::Bytes(data)) => Some(data.as_slice()),
        _ => None,
    })
}

/// Parse an on-air advertisement record.
///
/// A zero length byte ends the record (the remainder is padding).
///
/// # Errors
///
/// Returns [`DecodeError::LengthMismatch`] when a length byte claims more
/// bytes than remain.
pub fn parse_raw(data: &[u8]) -> Result<Vec<AdvertisementField>, DecodeError> {
    let mut fields = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let len = data[offset] as usize;
        if len == 0 {
            break;
        }

        let available = data.len() - offset - 1;
        if len > available {
            return Err(DecodeError::LengthMismatch {
                offset,
                declared: len,
                available,
            });
        }

        let ad_type = data[offset + 1];
        let payload = &data[offset + 2..offset + 1 + len];
        fields.push(AdvertisementField::new(ad_type, raw_value(ad_type, payload)));

        offset += 1 + len;
    }

    Ok(fields)
}

fn raw_value(ad_type: u8, payload: &[u8]) -> FieldValue {
    match ad_type {
        AD_TYPE_SHORT_LOCAL_NAME | AD_TYPE_COMPLETE_LOCAL_NAME => {
            FieldValue::Text(String::from_utf8_lossy(payload).into_owned())
        }
        AD_TYPE_INCOMPLETE_16B_SERVICES | AD_TYPE_COMPLETE_16B_SERVICES
            if payload.len() % 2 == 0 =>
        {
            FieldValue::Uuids(
                payload
                    .chunks(2)
                    .map(|c| uuid_from_u16(u16::from_le_bytes([c[0], c[1]])))
                    .collect(),
            )
        }
        0x06 | AD_TYPE_COMPLETE_128B_SERVICES if payload.len() % 16 == 0 => FieldValue::Uuids(
            payload
                .chunks(16)
                .map(|c| {
                    let mut raw = [0u8; 16];
                    raw.copy_from_slice(c);
                    Uuid::from_u128(u128::from_le_bytes(raw))
                })
                .collect(),
        ),
        _ => FieldValue::Bytes(payload.to_vec()),
    }
}

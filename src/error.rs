//! Error types for the ble-scan-kit crate.

use thiserror::Error;

/// Errors produced while decoding advertisement records or sensor payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The input is shorter than the layout requires.
    #[error("Payload too short: {actual} bytes (need at least {required})")]
    TooShort {
        /// Number of bytes required.
        required: usize,
        /// Number of bytes available.
        actual: usize,
    },

    /// The input contains a character that is not a hex digit, or an odd digit count.
    #[error("Invalid hex string: {input:?}")]
    InvalidHex {
        /// The offending input.
        input: String,
    },

    /// An on-air advertisement record declares more payload than is present.
    #[error("Record at offset {offset} declares {declared} bytes but only {available} remain")]
    LengthMismatch {
        /// Offset of the length byte within the record.
        offset: usize,
        /// Length claimed by the length byte.
        declared: usize,
        /// Bytes actually left after the length byte.
        available: usize,
    },

    /// A field is too large to be encoded with a one-byte length prefix.
    #[error("Field payload of {len} bytes does not fit an advertisement record")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
    },
}

/// Coarse classification of an [`Error`], used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// An established link went away in the middle of an operation.
    Disconnect,
    /// A momentary radio or GATT failure.
    Transient,
    /// Malformed or truncated data.
    Decode,
    /// The adapter itself is unusable.
    Adapter,
    /// The caller asked for something that cannot exist.
    Usage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnect => write!(f, "disconnect"),
            Self::Transient => write!(f, "transient"),
            Self::Decode => write!(f, "decode"),
            Self::Adapter => write!(f, "adapter"),
            Self::Usage => write!(f, "usage"),
        }
    }
}

/// GATT step a retry budget applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Establishing a connection and walking the attribute table.
    Connect,
    /// Enumerating the characteristics of one service.
    Characteristics,
    /// Reading one characteristic value.
    Read,
    /// Writing one characteristic value.
    Write,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Characteristics => write!(f, "getCharacteristics"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No adapter exists at the requested index.
    #[error("No Bluetooth adapter at index {index}")]
    AdapterNotFound {
        /// The requested adapter index.
        index: usize,
    },

    /// The link to the device was lost while an operation was under way.
    #[error("Disconnected from {address}: {reason}")]
    Disconnected {
        /// Address of the device.
        address: String,
        /// What the stack reported.
        reason: String,
    },

    /// A failure that is worth retrying.
    #[error("{operation} failed: {reason}")]
    Transient {
        /// The step that failed.
        operation: Operation,
        /// What the stack reported.
        reason: String,
    },

    /// Payload decoding failed.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A retried operation used up its whole budget.
    #[error("{operation}: failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// The step that was retried.
        operation: Operation,
        /// How many times it was tried.
        attempts: u32,
        /// The error from the final attempt.
        last_error: Box<Error>,
    },

    /// The device was never seen by the adapter.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID or handle that was not found.
        uuid: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

impl Error {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bluetooth(btleplug::Error::NotConnected) => ErrorKind::Disconnect,
            Self::Bluetooth(btleplug::Error::PermissionDenied) => ErrorKind::Adapter,
            Self::Bluetooth(_) => ErrorKind::Transient,
            Self::BluetoothUnavailable | Self::AdapterNotFound { .. } => ErrorKind::Adapter,
            Self::Disconnected { .. } | Self::NotConnected => ErrorKind::Disconnect,
            Self::Transient { .. } | Self::RetryExhausted { .. } => ErrorKind::Transient,
            Self::Decode(_) => ErrorKind::Decode,
            Self::DeviceNotFound { .. }
            | Self::CharacteristicNotFound { .. }
            | Self::InvalidParameter { .. } => ErrorKind::Usage,
        }
    }

    /// Whether this error means an active link was torn down.
    pub fn is_disconnect(&self) -> bool {
        self.kind() == ErrorKind::Disconnect
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

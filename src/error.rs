//! # Error Types Module
//!
//! Centralized error handling for vitalink.
//! Each concern gets its own error type with proper context and error chaining.
//!
//! ## Error Types
//! - `SessionError`: short-range link failures surfaced to the caller
//! - `TransportError`: failures reported by a link transport backend
//! - `PollError`: local-network fetch failures
//! - `StorageError`: persistence failures (logged, never fatal)
//! - `ConfigError`: configuration file I/O and parsing errors
//! - `ProfileError`: rejected profile updates
//!
//! Malformed payloads and incomplete profiles are not errors here: the sample
//! validator drops or zeroes bad fields and calorie accrual simply skips.

use crate::session::ConnectionState;
use std::fmt;

/// Errors surfaced to the UI by the short-range connection session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Platform refused the scan/connect permissions
    PermissionDenied,
    /// Radio is off or no adapter is present
    LinkDisabled,
    /// Connect, discovery or subscription failed for a user-initiated attempt
    DeviceUnreachable { device_id: String, reason: String },
    /// Transport could not start a scan
    ScanFailed(String),
    /// Automatic reconnection gave up
    ReconnectExhausted { device_id: String, attempts: u32 },
    /// Request does not fit the current state
    Busy(ConnectionState),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::PermissionDenied => {
                write!(f, "Bluetooth permissions are required to scan for devices")
            }
            SessionError::LinkDisabled => {
                write!(f, "Bluetooth is disabled. Please enable Bluetooth to scan for devices.")
            }
            SessionError::DeviceUnreachable { device_id, reason } => {
                write!(f, "Could not connect to device {}: {}", device_id, reason)
            }
            SessionError::ScanFailed(msg) => {
                write!(f, "Scan operation failed: {}", msg)
            }
            SessionError::ReconnectExhausted { device_id, attempts } => {
                write!(
                    f,
                    "Unable to maintain connection to {} after {} attempts. Please reconnect manually.",
                    device_id, attempts
                )
            }
            SessionError::Busy(state) => {
                write!(f, "Request not allowed while {:?}", state)
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Errors reported by a link transport backend
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Bluetooth adapter not found or not available
    NoAdapter,
    /// Device id is unknown to the transport
    UnknownDevice(String),
    /// Service/characteristic pair not exposed by the device
    MissingCharacteristic { service: String, characteristic: String },
    /// Operation did not finish in time
    Timeout,
    /// Any other backend failure
    Backend(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NoAdapter => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            TransportError::UnknownDevice(id) => write!(f, "Unknown device {}", id),
            TransportError::MissingCharacteristic { service, characteristic } => {
                write!(f, "Characteristic {} not found in service {}", characteristic, service)
            }
            TransportError::Timeout => write!(f, "Operation timed out"),
            TransportError::Backend(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        TransportError::Backend(e.to_string())
    }
}

/// Errors that can occur while fetching readings from the sensor node
#[derive(Debug)]
pub enum PollError {
    /// Request could not be sent or the body could not be read
    Http(reqwest::Error),
    /// Node answered with a non-success status
    Status(u16),
    /// No response within the request timeout
    Timeout,
    /// Body was not valid JSON
    Parse(String),
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Http(e) => write!(f, "HTTP request failed: {}", e),
            PollError::Status(code) => write!(f, "HTTP error! status: {}", code),
            PollError::Timeout => write!(f, "Request timed out"),
            PollError::Parse(msg) => write!(f, "Failed to parse readings: {}", msg),
        }
    }
}

impl std::error::Error for PollError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for PollError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PollError::Timeout
        } else if e.is_decode() {
            PollError::Parse(e.to_string())
        } else {
            PollError::Http(e)
        }
    }
}

/// Errors that can occur while persisting profile or ledger data
#[derive(Debug)]
pub enum StorageError {
    /// Reading or writing the backing file failed
    Io { key: String, source: std::io::Error },
    /// Stored value could not be encoded
    Encode(serde_json::Error),
    /// Stored value could not be decoded
    Decode(serde_json::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io { key, source } => {
                write!(f, "Failed to access stored value {}: {}", key, source)
            }
            StorageError::Encode(e) => write!(f, "Failed to encode stored value: {}", e),
            StorageError::Decode(e) => write!(f, "Failed to decode stored value: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io { source, .. } => Some(source),
            StorageError::Encode(e) => Some(e),
            StorageError::Decode(e) => Some(e),
        }
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}

/// Rejected profile update
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileError {
    /// Field value outside its accepted range
    OutOfRange { field: &'static str, value: f64 },
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::OutOfRange { field, value } => {
                write!(f, "{} value {} is out of range", field, value)
            }
        }
    }
}

impl std::error::Error for ProfileError {}

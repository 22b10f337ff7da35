//! Error types for the BLE session

use serde::Serialize;
use thiserror::Error;

use crate::core::bluetooth::types::{DeviceId, ErrorKind};

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Why the runtime environment cannot use Bluetooth right now
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GateError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Bluetooth is not supported on this device")]
    AdapterUnsupported,

    #[error("Bluetooth adapter is powered off")]
    AdapterOff,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScanError {
    #[error("Bluetooth not ready: {0}")]
    NotReady(GateError),

    #[error("Scan already in progress")]
    AlreadyScanning,

    #[error("Scan timeout must be positive")]
    InvalidTimeout,

    #[error("Failed to start scan: {0}")]
    Platform(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectError {
    #[error("Device not found: {0}")]
    UnknownDevice(DeviceId),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Already connected to {0}")]
    AlreadyConnected(DeviceId),

    #[error("No device found during scan")]
    NoDeviceFound,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CancelError {
    #[error("Nothing to cancel")]
    NothingToCancel,
}

/// Synchronous rejection of a user command. Session state is unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CommandError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Cancel(#[from] CancelError),

    #[error("Another command is already being processed")]
    ConcurrentCommand,

    #[error("Session manager has shut down")]
    Shutdown,
}

/// Failures reported by the platform Bluetooth binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Bluetooth adapter not available")]
    Unavailable,

    #[error("Bluetooth permission denied by the platform")]
    PermissionDenied,

    #[error("Platform operation timed out")]
    Timeout,

    #[error("Operation not supported on this platform: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    /// Maps a binding failure during a link attempt to the closest session error.
    pub fn into_error_kind(self) -> ErrorKind {
        match self {
            PlatformError::Timeout => ErrorKind::Connect(ConnectError::Timeout),
            PlatformError::PermissionDenied => ErrorKind::Gate(GateError::PermissionDenied),
            PlatformError::Unavailable => ErrorKind::Gate(GateError::AdapterOff),
            other => ErrorKind::Connect(ConnectError::Refused(other.to_string())),
        }
    }
}

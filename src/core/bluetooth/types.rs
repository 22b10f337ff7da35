//! Defines shared data structures for the Bluetooth module.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::error::{ConnectError, GateError};

/// Platform-assigned identifier of a peripheral. Opaque and stable for the
/// lifetime of the process.
pub type DeviceId = String;

/// Radio state as reported by the platform adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    Unsupported,
    PoweredOff,
    PoweredOn,
}

/// Runtime Bluetooth permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PermissionState {
    #[default]
    NotRequested,
    Denied,
    Granted,
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    /// Platform-specific unique identifier for the device
    pub id: DeviceId,
    /// The advertised name of the device, if available
    pub display_name: Option<String>,
    /// The signal strength (RSSI, dBm) of the latest advertisement
    pub signal_strength: i16,
    /// When the device was last heard
    pub last_seen_at: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Creates a new DiscoveredDevice instance
    pub fn new(
        id: DeviceId,
        display_name: Option<String>,
        signal_strength: i16,
        last_seen_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            display_name,
            signal_strength,
            last_seen_at,
        }
    }
}

/// Primary state variable of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Failed,
}

impl ConnectionPhase {
    /// Phases in which an active peripheral link is held.
    pub fn holds_link(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Disconnecting | Self::Reconnecting
        )
    }
}

/// Operational error recorded in the session snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Gate(GateError),
    Connect(ConnectError),
}

impl From<GateError> for ErrorKind {
    fn from(err: GateError) -> Self {
        ErrorKind::Gate(err)
    }
}

impl From<ConnectError> for ErrorKind {
    fn from(err: ConnectError) -> Self {
        ErrorKind::Connect(err)
    }
}

/// Immutable snapshot handed to consumers.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SessionState {
    pub connection: ConnectionPhase,
    pub adapter: AdapterState,
    pub permission: PermissionState,
    /// Ordered by descending signal strength
    pub devices: Vec<DiscoveredDevice>,
    pub active_device_id: Option<DeviceId>,
    pub last_error: Option<ErrorKind>,
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    UserDisconnect,
    Cancelled,
    ReconnectExhausted,
    AdapterLost,
    Shutdown,
}

/// Session lifecycle notifications consumed by the app-state store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionEvent {
    Started {
        device_id: DeviceId,
        started_at: DateTime<Utc>,
    },
    Ended {
        device_id: DeviceId,
        started_at: DateTime<Utc>,
        duration: Duration,
        reason: EndReason,
    },
}

//! Boundary to the platform Bluetooth stack
//! The session manager only talks to the radio through [`BlePlatform`] and only
//! learns about the radio through [`PlatformEvent`]s.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::error::PlatformError;
use crate::core::bluetooth::types::{AdapterState, DeviceId, PermissionState};

/// Everything the platform can report asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    AdapterStateChanged(AdapterState),
    DeviceDiscovered {
        id: DeviceId,
        name: Option<String>,
        rssi: i16,
    },
    PeripheralConnected {
        id: DeviceId,
    },
    /// Link went down, whether requested or not. `reason` carries the
    /// platform's diagnostic when there is one.
    PeripheralDisconnected {
        id: DeviceId,
        reason: Option<String>,
    },
    /// A pending link attempt was refused or errored.
    ConnectFailed {
        id: DeviceId,
        reason: String,
    },
    /// The platform ended discovery on its own.
    ScanStopped,
}

pub type PlatformEventSender = mpsc::UnboundedSender<PlatformEvent>;
pub type PlatformEvents = mpsc::UnboundedReceiver<PlatformEvent>;

/// Creates the channel a binding reports its events on.
pub fn event_channel() -> (PlatformEventSender, PlatformEvents) {
    mpsc::unbounded_channel()
}

/// Requests the session manager can issue against the radio.
///
/// Requests return as soon as they are issued. Their outcomes (link up, link
/// refused, discoveries) are reported through the binding's event channel.
#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Current radio state.
    async fn adapter_state(&self) -> AdapterState;

    /// Current permission without prompting the user.
    async fn permission_state(&self) -> PermissionState;

    /// Prompts the user for permission if the platform needs to.
    async fn request_permission(&self) -> PermissionState;

    /// Asks the platform to power the radio on.
    async fn enable_radio(&self) -> Result<(), PlatformError>;

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), PlatformError>;

    async fn stop_scan(&self) -> Result<(), PlatformError>;

    async fn connect(&self, id: &DeviceId) -> Result<(), PlatformError>;

    async fn disconnect(&self, id: &DeviceId) -> Result<(), PlatformError>;
}

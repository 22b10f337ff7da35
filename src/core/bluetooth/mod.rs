//! Bluetooth session management for the Smart Yoga Mat
//! This module owns everything between the UI and the platform radio:
//! readiness checks, scanning, and the lifecycle of the single mat link.

#[cfg(feature = "bluest")]
mod bluest_platform;
mod connection;
mod constants;
mod error;
mod gate;
mod manager;
mod notification;
mod platform;
mod scanner;
mod simulated;
mod timers;
mod types;

// Re-export types that should be publicly accessible
#[cfg(feature = "bluest")]
pub use bluest_platform::BluestPlatform;
pub use connection::{Action, ConnectionLifecycle, ReconnectPolicy};
pub use constants::*; // Re-export all constants
pub use error::{CancelError, CommandError, ConnectError, GateError, PlatformError, ScanError};
pub use gate::{CapabilityGate, Ready};
pub use manager::SessionManager;
pub use notification::{Subscribers, Subscription};
pub use platform::{event_channel, BlePlatform, PlatformEvent, PlatformEventSender, PlatformEvents};
pub use scanner::ScanOrchestrator;
pub use simulated::{PlatformCall, SimulatedPlatform, SimulatorHandle};
pub use timers::{TimerFired, TimerKind, Timers};
pub use types::{
    AdapterState, ConnectionPhase, DeviceId, DiscoveredDevice, EndReason, ErrorKind,
    PermissionState, SessionEvent, SessionState,
};

//! Adapter capability gate
//! Decides whether the radio may be used before any scan or connect is issued.

use log::{debug, info};
use serde::Serialize;

use crate::core::bluetooth::error::GateError;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::types::{AdapterState, PermissionState};

/// Proof that the adapter is powered and permission is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ready;

#[derive(Debug, Default)]
pub struct CapabilityGate {
    adapter: AdapterState,
    permission: PermissionState,
}

impl CapabilityGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter(&self) -> AdapterState {
        self.adapter
    }

    pub fn permission(&self) -> PermissionState {
        self.permission
    }

    /// Records an adapter state reported by the platform. Returns true on change.
    pub fn observe_adapter(&mut self, state: AdapterState) -> bool {
        if self.adapter == state {
            return false;
        }
        info!("Adapter state {:?} -> {:?}", self.adapter, state);
        self.adapter = state;
        true
    }

    /// Records a permission answer. Returns true on change.
    pub fn observe_permission(&mut self, permission: PermissionState) -> bool {
        if self.permission == permission {
            return false;
        }
        info!("Bluetooth permission {:?} -> {:?}", self.permission, permission);
        self.permission = permission;
        true
    }

    /// Readiness from what is already known, without touching the platform.
    pub fn evaluate(&self) -> Result<Ready, GateError> {
        if self.adapter == AdapterState::Unsupported {
            return Err(GateError::AdapterUnsupported);
        }
        if self.permission != PermissionState::Granted {
            return Err(GateError::PermissionDenied);
        }
        match self.adapter {
            AdapterState::PoweredOn => Ok(Ready),
            _ => Err(GateError::AdapterOff),
        }
    }

    /// Checks (and if needed requests) everything a scan or connect needs.
    ///
    /// Once ready, repeated calls return immediately without consulting the
    /// platform, so the user is never prompted twice.
    pub async fn check_readiness<P>(&mut self, platform: &P) -> Result<Ready, GateError>
    where
        P: BlePlatform + ?Sized,
    {
        if self.evaluate().is_ok() {
            return Ok(Ready);
        }

        if self.adapter == AdapterState::Unknown {
            let state = platform.adapter_state().await;
            self.observe_adapter(state);
        }
        if self.adapter == AdapterState::Unsupported {
            return Err(GateError::AdapterUnsupported);
        }

        let permission = match self.permission {
            PermissionState::NotRequested => {
                info!("Requesting Bluetooth permission");
                platform.request_permission().await
            }
            // Re-read only: the user may have granted it in system settings.
            PermissionState::Denied => platform.permission_state().await,
            PermissionState::Granted => PermissionState::Granted,
        };
        self.observe_permission(permission);
        if permission != PermissionState::Granted {
            return Err(GateError::PermissionDenied);
        }

        if self.adapter != AdapterState::PoweredOn {
            let state = platform.adapter_state().await;
            debug!("Re-read adapter state: {:?}", state);
            self.observe_adapter(state);
        }

        match self.adapter {
            AdapterState::PoweredOn => Ok(Ready),
            AdapterState::Unsupported => Err(GateError::AdapterUnsupported),
            AdapterState::Unknown | AdapterState::PoweredOff => Err(GateError::AdapterOff),
        }
    }
}

//! In-memory Bluetooth platform
//! Stands in for the radio when no hardware is around: every request is
//! recorded and every event is injected through a [`SimulatorHandle`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use crate::core::bluetooth::error::PlatformError;
use crate::core::bluetooth::platform::{
    event_channel, BlePlatform, PlatformEvent, PlatformEventSender, PlatformEvents,
};
use crate::core::bluetooth::types::{AdapterState, DeviceId, PermissionState};

/// A request the session manager issued against the simulated radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    AdapterState,
    PermissionState,
    RequestPermission,
    EnableRadio,
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
}

#[derive(Debug)]
struct SimState {
    adapter: AdapterState,
    permission: PermissionState,
    permission_answer: PermissionState,
    fail_next_connect: Option<PlatformError>,
    fail_next_scan: Option<PlatformError>,
    calls: Vec<PlatformCall>,
    released: bool,
}

type Shared = Arc<Mutex<SimState>>;

fn lock(state: &Shared) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimulatedPlatform {
    state: Shared,
    events: PlatformEventSender,
}

/// Test/demo side of the simulated radio.
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Shared,
    events: PlatformEventSender,
}

impl SimulatedPlatform {
    /// A powered-on radio that grants permission when asked.
    pub fn new() -> (Self, SimulatorHandle, PlatformEvents) {
        let (tx, rx) = event_channel();
        let state = Arc::new(Mutex::new(SimState {
            adapter: AdapterState::PoweredOn,
            permission: PermissionState::NotRequested,
            permission_answer: PermissionState::Granted,
            fail_next_connect: None,
            fail_next_scan: None,
            calls: Vec::new(),
            released: false,
        }));
        let platform = Self {
            state: state.clone(),
            events: tx.clone(),
        };
        let handle = SimulatorHandle { state, events: tx };
        (platform, handle, rx)
    }

    fn record(&self, call: PlatformCall) -> MutexGuard<'_, SimState> {
        debug!("Simulated platform call: {:?}", call);
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }
}

impl Drop for SimulatedPlatform {
    fn drop(&mut self) {
        debug!("Simulated radio released");
        lock(&self.state).released = true;
    }
}

#[async_trait]
impl BlePlatform for SimulatedPlatform {
    async fn adapter_state(&self) -> AdapterState {
        self.record(PlatformCall::AdapterState).adapter
    }

    async fn permission_state(&self) -> PermissionState {
        let mut state = self.record(PlatformCall::PermissionState);
        // Reflects what the user decided outside the app.
        if state.permission != PermissionState::NotRequested {
            state.permission = state.permission_answer;
        }
        state.permission
    }

    async fn request_permission(&self) -> PermissionState {
        let mut state = self.record(PlatformCall::RequestPermission);
        state.permission = state.permission_answer;
        state.permission
    }

    async fn enable_radio(&self) -> Result<(), PlatformError> {
        let mut state = self.record(PlatformCall::EnableRadio);
        match state.adapter {
            AdapterState::Unsupported => Err(PlatformError::Unavailable),
            AdapterState::PoweredOn => Ok(()),
            _ => {
                state.adapter = AdapterState::PoweredOn;
                let _ = self
                    .events
                    .send(PlatformEvent::AdapterStateChanged(AdapterState::PoweredOn));
                Ok(())
            }
        }
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), PlatformError> {
        let mut state = self.record(PlatformCall::StartScan(services.to_vec()));
        match state.fail_next_scan.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stop_scan(&self) -> Result<(), PlatformError> {
        drop(self.record(PlatformCall::StopScan));
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), PlatformError> {
        let mut state = self.record(PlatformCall::Connect(id.clone()));
        match state.fail_next_connect.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<(), PlatformError> {
        drop(self.record(PlatformCall::Disconnect(id.clone())));
        Ok(())
    }
}

impl SimulatorHandle {
    /// Injects a raw platform event.
    pub fn emit(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }

    /// Answer returned by the next adapter-state query. No event is emitted.
    pub fn set_adapter_state(&self, adapter: AdapterState) {
        lock(&self.state).adapter = adapter;
    }

    /// Changes the radio state and reports it like the platform would.
    pub fn change_adapter_state(&self, adapter: AdapterState) {
        self.set_adapter_state(adapter);
        self.emit(PlatformEvent::AdapterStateChanged(adapter));
    }

    /// Answer the user gives to permission prompts from now on.
    pub fn set_permission_answer(&self, permission: PermissionState) {
        lock(&self.state).permission_answer = permission;
    }

    pub fn fail_next_connect(&self, err: PlatformError) {
        lock(&self.state).fail_next_connect = Some(err);
    }

    pub fn fail_next_scan(&self, err: PlatformError) {
        lock(&self.state).fail_next_scan = Some(err);
    }

    pub fn discover(&self, id: &str, name: Option<&str>, rssi: i16) {
        self.emit(PlatformEvent::DeviceDiscovered {
            id: id.to_string(),
            name: name.map(str::to_string),
            rssi,
        });
    }

    pub fn link_up(&self, id: &str) {
        self.emit(PlatformEvent::PeripheralConnected { id: id.to_string() });
    }

    pub fn link_lost(&self, id: &str) {
        self.emit(PlatformEvent::PeripheralDisconnected {
            id: id.to_string(),
            reason: Some("link supervision timeout".to_string()),
        });
    }

    pub fn refuse(&self, id: &str, reason: &str) {
        self.emit(PlatformEvent::ConnectFailed {
            id: id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        lock(&self.state).calls.clone()
    }

    /// Devices the manager asked to connect to, in order.
    pub fn connect_calls(&self) -> Vec<DeviceId> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                PlatformCall::Connect(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn disconnect_calls(&self) -> Vec<DeviceId> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                PlatformCall::Disconnect(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn permission_prompts(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| matches!(call, PlatformCall::RequestPermission))
            .count()
    }

    /// True once the session manager has let go of the radio.
    pub fn is_released(&self) -> bool {
        lock(&self.state).released
    }
}

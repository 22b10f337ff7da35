//! Bluetooth session manager for the Smart Yoga Mat
//! This module provides the main interface for bluetooth operations. A single
//! actor task owns the session state and handles user commands, platform
//! events and timer reports one at a time, each source in arrival order.
//! Platform events already delivered are handled before the next command.
//! The task stops once every `SessionManager` handle is gone.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::connection::{Action, ConnectionLifecycle};
use crate::core::bluetooth::error::{
    CommandError, ConnectError, GateError, PlatformError, ScanError,
};
use crate::core::bluetooth::gate::{CapabilityGate, Ready};
use crate::core::bluetooth::notification::{Subscribers, Subscription};
use crate::core::bluetooth::platform::{BlePlatform, PlatformEvent, PlatformEvents};
use crate::core::bluetooth::scanner::ScanOrchestrator;
use crate::core::bluetooth::timers::{TimerFired, TimerKind, Timers};
use crate::core::bluetooth::types::{
    AdapterState, ConnectionPhase, DeviceId, DiscoveredDevice, PermissionState, SessionEvent,
    SessionState,
};

// === Commands ===

#[derive(Debug)]
enum Command {
    CheckReadiness,
    EnableRadio,
    StartScan {
        filter: Option<Vec<Uuid>>,
        timeout: Duration,
    },
    StopScan,
    Connect(Option<DeviceId>),
    Disconnect,
    Cancel,
    Shutdown,
}

type Reply = oneshot::Sender<Result<(), CommandError>>;

#[derive(Debug)]
enum Input {
    Command(Command, Reply),
    Platform(PlatformEvent),
    Timer(TimerFired),
}

impl From<TimerFired> for Input {
    fn from(fired: TimerFired) -> Self {
        Input::Timer(fired)
    }
}

// === Facade ===

/// Handle the presentation layer holds. Cheap to clone; all clones drive the
/// same session.
#[derive(Clone)]
pub struct SessionManager {
    inbox: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<SessionState>,
    state_subscribers: Subscribers<SessionState>,
    session_subscribers: Subscribers<SessionEvent>,
    in_flight: Arc<AtomicBool>,
    default_scan_timeout: Duration,
}

impl SessionManager {
    /// Starts the session task on the current tokio runtime.
    pub fn spawn<P: BlePlatform>(
        platform: P,
        events: PlatformEvents,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name_filter = config.name_filter()?;

        let (inbox, queue) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::default());
        let state_subscribers = Subscribers::new();
        let session_subscribers = Subscribers::new();

        let actor = SessionActor {
            platform,
            events: Some(events),
            queue,
            gate: CapabilityGate::new(),
            scanner: ScanOrchestrator::new(name_filter, config.min_rssi),
            lifecycle: ConnectionLifecycle::new(
                config.reconnect_policy(),
                config.connect_timeout(),
                config.disconnect_timeout(),
            ),
            timers: Timers::new(inbox.downgrade()),
            devices_view: Vec::new(),
            session: None,
            state_tx,
            state_subscribers: state_subscribers.clone(),
            session_subscribers: session_subscribers.clone(),
            running: true,
            config: config.clone(),
        };

        tokio::spawn(actor.run());

        Ok(Self {
            inbox,
            state: state_rx,
            state_subscribers,
            session_subscribers,
            in_flight: Arc::new(AtomicBool::new(false)),
            default_scan_timeout: config.scan_timeout(),
        })
    }

    /// Latest published snapshot.
    pub fn get_state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Snapshot stream for async consumers.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Calls `callback` with the new snapshot after every state transition.
    /// Callbacks run on the session task and must not block.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.state_subscribers.subscribe(callback)
    }

    /// Calls `callback` when a connected session starts or ends.
    pub fn subscribe_session_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.session_subscribers.subscribe(callback)
    }

    pub async fn check_readiness(&self) -> Result<Ready, CommandError> {
        self.request(Command::CheckReadiness).await.map(|()| Ready)
    }

    /// Asks the platform to power the radio on.
    pub async fn enable_radio(&self) -> Result<(), CommandError> {
        self.request(Command::EnableRadio).await
    }

    /// Starts discovery. `timeout` defaults to the configured scan window.
    pub async fn start_scan(
        &self,
        filter: Option<Vec<Uuid>>,
        timeout: Option<Duration>,
    ) -> Result<(), CommandError> {
        let timeout = timeout.unwrap_or(self.default_scan_timeout);
        self.request(Command::StartScan { filter, timeout }).await
    }

    pub async fn stop_scan(&self) -> Result<(), CommandError> {
        self.request(Command::StopScan).await
    }

    /// Connects to `device_id`, or with `None` scans and picks the strongest
    /// mat (retrying the last device after a failure).
    pub async fn connect(&self, device_id: Option<DeviceId>) -> Result<(), CommandError> {
        self.request(Command::Connect(device_id)).await
    }

    pub async fn disconnect(&self) -> Result<(), CommandError> {
        self.request(Command::Disconnect).await
    }

    pub async fn cancel(&self) -> Result<(), CommandError> {
        self.request(Command::Cancel).await
    }

    /// Releases the link and stops the session task.
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        self.request(Command::Shutdown).await
    }

    async fn request(&self, command: Command) -> Result<(), CommandError> {
        let _guard = InFlight::acquire(&self.in_flight)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inbox
            .send(Input::Command(command, reply_tx))
            .map_err(|_| CommandError::Shutdown)?;
        reply_rx.await.map_err(|_| CommandError::Shutdown)?
    }
}

/// Marks a command as being processed; released on drop.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, CommandError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CommandError::ConcurrentCommand)?;
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// === Session Actor ===

struct ActiveSession {
    device_id: DeviceId,
    started_at: DateTime<Utc>,
    started: Instant,
}

struct SessionActor<P> {
    platform: P,
    config: SessionConfig,
    /// None once the binding has closed its event stream
    events: Option<PlatformEvents>,
    /// Commands and timer reports. Only facade handles keep it open.
    queue: mpsc::UnboundedReceiver<Input>,

    gate: CapabilityGate,
    scanner: ScanOrchestrator,
    lifecycle: ConnectionLifecycle,
    timers: Timers<Input>,

    /// Devices as of the last published batch
    devices_view: Vec<DiscoveredDevice>,
    session: Option<ActiveSession>,

    state_tx: watch::Sender<SessionState>,
    state_subscribers: Subscribers<SessionState>,
    session_subscribers: Subscribers<SessionEvent>,
    running: bool,
}

impl<P: BlePlatform> SessionActor<P> {
    async fn run(mut self) {
        info!("BLE session manager starting up");
        self.seed().await;
        self.publish();

        while self.running {
            let Some(input) = self.next_input().await else {
                info!("All session handles dropped");
                self.shutdown().await;
                self.publish();
                break;
            };
            match input {
                Input::Command(command, reply) => {
                    debug!("Command: {:?}", command);
                    let result = self.handle_command(command).await;
                    if let Err(e) = &result {
                        info!("Command rejected: {}", e);
                    }
                    self.publish();
                    let _ = reply.send(result);
                }
                Input::Platform(event) => {
                    debug!("Platform event: {:?}", event);
                    self.handle_platform_event(event).await;
                    self.publish();
                }
                Input::Timer(fired) => {
                    if self.timers.accept(fired) {
                        self.handle_timer(fired.kind).await;
                        self.publish();
                    }
                }
            }
            debug_assert!(self.lifecycle.invariant_holds());
        }

        self.timers.cancel_all();
        info!("BLE session manager stopped");
    }

    async fn next_input(&mut self) -> Option<Input> {
        loop {
            let Some(events) = self.events.as_mut() else {
                return self.queue.recv().await;
            };
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => return Some(Input::Platform(event)),
                    None => debug!("Platform event stream ended"),
                },
                input = self.queue.recv() => return input,
            }
            self.events = None;
        }
    }

    /// Initial adapter and permission state, without prompting.
    async fn seed(&mut self) {
        let adapter = self.platform.adapter_state().await;
        self.gate.observe_adapter(adapter);
        let permission = self.platform.permission_state().await;
        if permission != PermissionState::NotRequested {
            self.gate.observe_permission(permission);
        }
    }

    fn publish(&mut self) {
        let snapshot = SessionState {
            connection: self.lifecycle.phase(),
            adapter: self.gate.adapter(),
            permission: self.gate.permission(),
            devices: self.devices_view.clone(),
            active_device_id: self.lifecycle.active_device().cloned(),
            last_error: self.lifecycle.last_error().cloned(),
        };
        if *self.state_tx.borrow() == snapshot {
            return;
        }
        debug!(
            "Publishing {:?} ({} device(s))",
            snapshot.connection,
            snapshot.devices.len()
        );
        self.state_tx.send_replace(snapshot.clone());
        self.state_subscribers.notify(&snapshot);
    }

    fn refresh_devices(&mut self) {
        self.devices_view = self.scanner.sorted();
    }

    // --- Commands ---

    async fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::CheckReadiness => {
                self.gate.check_readiness(&self.platform).await?;
                Ok(())
            }
            Command::EnableRadio => self.enable_radio().await,
            Command::StartScan { filter, timeout } => self.start_scan(filter, timeout, false).await,
            Command::StopScan => {
                self.stop_scan().await;
                Ok(())
            }
            Command::Connect(device_id) => self.connect(device_id).await,
            Command::Disconnect => {
                let actions = self.lifecycle.disconnect();
                self.apply(actions).await;
                Ok(())
            }
            Command::Cancel => {
                let was_scanning = self.lifecycle.phase() == ConnectionPhase::Scanning;
                let actions = self.lifecycle.cancel()?;
                if was_scanning {
                    self.end_scan().await;
                }
                self.apply(actions).await;
                Ok(())
            }
            Command::Shutdown => {
                self.shutdown().await;
                Ok(())
            }
        }
    }

    async fn enable_radio(&mut self) -> Result<(), CommandError> {
        match self.gate.adapter() {
            AdapterState::PoweredOn => return Ok(()),
            AdapterState::Unsupported => return Err(GateError::AdapterUnsupported.into()),
            _ => {}
        }
        info!("Asking the platform to enable Bluetooth");
        match self.platform.enable_radio().await {
            Ok(()) => Ok(()),
            Err(PlatformError::PermissionDenied) => {
                self.gate.observe_permission(PermissionState::Denied);
                Err(GateError::PermissionDenied.into())
            }
            Err(PlatformError::Unavailable) => {
                self.gate.observe_adapter(AdapterState::Unsupported);
                Err(GateError::AdapterUnsupported.into())
            }
            Err(e) => {
                warn!("Failed to enable Bluetooth: {}", e);
                Err(GateError::AdapterOff.into())
            }
        }
    }

    async fn start_scan(
        &mut self,
        filter: Option<Vec<Uuid>>,
        timeout: Duration,
        auto_select: bool,
    ) -> Result<(), CommandError> {
        match self.lifecycle.phase() {
            ConnectionPhase::Scanning => return Err(ScanError::AlreadyScanning.into()),
            ConnectionPhase::Idle | ConnectionPhase::Failed => {}
            _ => return Err(CommandError::ConcurrentCommand),
        }
        if timeout.is_zero() {
            return Err(ScanError::InvalidTimeout.into());
        }
        self.gate
            .check_readiness(&self.platform)
            .await
            .map_err(ScanError::NotReady)?;

        let services = filter.unwrap_or_else(|| self.config.service_filter.clone());
        if let Err(e) = self.platform.start_scan(&services).await {
            warn!("Failed to start scan: {}", e);
            if e == PlatformError::PermissionDenied {
                self.gate.observe_permission(PermissionState::Denied);
                return Err(ScanError::NotReady(GateError::PermissionDenied).into());
            }
            return Err(ScanError::Platform(e.to_string()).into());
        }

        self.scanner.begin(&services, auto_select);
        self.refresh_devices();
        self.lifecycle.enter_scanning();
        self.timers.arm(TimerKind::ScanTimeout, timeout);
        Ok(())
    }

    async fn stop_scan(&mut self) {
        if self.lifecycle.phase() != ConnectionPhase::Scanning {
            debug!("stop_scan: no scan in progress");
            return;
        }
        self.end_scan().await;
        self.lifecycle.leave_scanning();
    }

    /// Stops the radio side of a scan and publishes what was found.
    async fn end_scan(&mut self) {
        self.timers.cancel(TimerKind::ScanTimeout);
        self.timers.cancel(TimerKind::ScanBatch);
        if self.scanner.is_active() {
            self.scanner.end();
            if let Err(e) = self.platform.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        }
        self.scanner.take_dirty();
        self.refresh_devices();
    }

    /// Scan window is over (timeout or the platform stopped on its own).
    async fn finish_scan(&mut self) {
        let auto_select = self.scanner.auto_select();
        self.end_scan().await;
        if auto_select {
            match self.scanner.strongest() {
                Some(id) => {
                    self.begin_connect(id).await;
                    return;
                }
                None => {
                    info!("Scan ended without finding a mat");
                    self.lifecycle.leave_scanning();
                    self.lifecycle
                        .set_last_error(Some(ConnectError::NoDeviceFound.into()));
                    return;
                }
            }
        }
        self.lifecycle.leave_scanning();
    }

    async fn connect(&mut self, device_id: Option<DeviceId>) -> Result<(), CommandError> {
        let phase = self.lifecycle.phase();
        match phase {
            ConnectionPhase::Connecting
            | ConnectionPhase::Reconnecting
            | ConnectionPhase::Disconnecting => return Err(CommandError::ConcurrentCommand),
            ConnectionPhase::Connected => {
                let active = self.lifecycle.active_device().cloned();
                return match device_id {
                    Some(id) if Some(&id) != active.as_ref() => {
                        Err(ConnectError::AlreadyConnected(active.unwrap_or_default()).into())
                    }
                    _ => Ok(()),
                };
            }
            ConnectionPhase::Scanning | ConnectionPhase::Idle | ConnectionPhase::Failed => {}
        }

        let id = match device_id {
            Some(id) => {
                let retrying =
                    phase == ConnectionPhase::Failed && self.lifecycle.last_target() == Some(&id);
                if !self.scanner.contains(&id) && !retrying {
                    return Err(ConnectError::UnknownDevice(id).into());
                }
                id
            }
            None if phase == ConnectionPhase::Scanning => {
                info!("Will connect to the strongest mat found");
                self.scanner.set_auto_select(true);
                self.select_strongest().await;
                return Ok(());
            }
            None => match (phase, self.lifecycle.last_target().cloned()) {
                (ConnectionPhase::Failed, Some(id)) => id,
                _ => {
                    let timeout = self.config.scan_timeout();
                    return self.start_scan(None, timeout, true).await;
                }
            },
        };

        self.gate.check_readiness(&self.platform).await?;
        self.begin_connect(id).await;
        Ok(())
    }

    /// Scanning must stop before a link attempt starts.
    async fn begin_connect(&mut self, id: DeviceId) {
        if self.scanner.is_active() {
            self.end_scan().await;
        }
        let actions = self.lifecycle.connect(id);
        self.apply(actions).await;
    }

    async fn select_strongest(&mut self) {
        if self.lifecycle.phase() != ConnectionPhase::Scanning || !self.scanner.auto_select() {
            return;
        }
        if let Some(id) = self.devices_view.first().map(|device| device.id.clone()) {
            info!("Auto-selecting {}", id);
            self.begin_connect(id).await;
        }
    }

    async fn shutdown(&mut self) {
        info!("BLE session manager shutting down");
        if self.scanner.is_active() {
            self.end_scan().await;
        }
        self.lifecycle.leave_scanning();
        let actions = self.lifecycle.shutdown();
        self.apply(actions).await;
        self.timers.cancel_all();
        self.running = false;
    }

    // --- Platform events ---

    async fn handle_platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::AdapterStateChanged(state) => {
                self.gate.observe_adapter(state);
                let error = match state {
                    AdapterState::PoweredOn | AdapterState::Unknown => return,
                    AdapterState::Unsupported => GateError::AdapterUnsupported,
                    AdapterState::PoweredOff => GateError::AdapterOff,
                };
                if self.scanner.is_active() {
                    self.end_scan().await;
                }
                let actions = self.lifecycle.adapter_lost(error);
                self.apply(actions).await;
            }
            PlatformEvent::DeviceDiscovered { id, name, rssi } => {
                if self.lifecycle.phase() != ConnectionPhase::Scanning {
                    debug!("Discovery of {} outside a scan ignored", id);
                    return;
                }
                if self.scanner.upsert(id, name, rssi, Utc::now())
                    && !self.timers.is_armed(TimerKind::ScanBatch)
                {
                    self.timers
                        .arm(TimerKind::ScanBatch, self.config.scan_batch_window());
                }
            }
            PlatformEvent::PeripheralConnected { id } => {
                let actions = self.lifecycle.on_link_up(&id);
                self.apply(actions).await;
            }
            PlatformEvent::PeripheralDisconnected { id, reason } => {
                let actions = self.lifecycle.on_link_down(&id, reason.as_deref());
                self.apply(actions).await;
            }
            PlatformEvent::ConnectFailed { id, reason } => {
                let actions = self
                    .lifecycle
                    .on_connect_failed(&id, ConnectError::Refused(reason).into());
                self.apply(actions).await;
            }
            PlatformEvent::ScanStopped => {
                if self.lifecycle.phase() == ConnectionPhase::Scanning {
                    info!("Platform ended the scan");
                    self.finish_scan().await;
                }
            }
        }
    }

    // --- Timers ---

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ScanTimeout => {
                if self.lifecycle.phase() == ConnectionPhase::Scanning {
                    info!("Scan window elapsed");
                    self.finish_scan().await;
                }
            }
            TimerKind::ScanBatch => {
                if self.scanner.take_dirty() {
                    self.refresh_devices();
                    self.publish();
                    self.select_strongest().await;
                }
            }
            other => {
                let actions = self.lifecycle.on_timer(other);
                self.apply(actions).await;
            }
        }
    }

    // --- Effects ---

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut pending: VecDeque<Action> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Connect(id) => {
                    if let Err(e) = self.platform.connect(&id).await {
                        warn!("Connect request for {} failed: {}", id, e);
                        if e == PlatformError::PermissionDenied {
                            self.gate.observe_permission(PermissionState::Denied);
                        }
                        pending.extend(self.lifecycle.on_connect_failed(&id, e.into_error_kind()));
                    }
                }
                Action::Disconnect(id) => {
                    if let Err(e) = self.platform.disconnect(&id).await {
                        warn!("Disconnect request for {} failed: {}", id, e);
                    }
                }
                Action::ArmTimer(kind, delay) => self.timers.arm(kind, delay),
                Action::CancelTimer(kind) => self.timers.cancel(kind),
                Action::SessionStarted(device_id) => {
                    // The selection is consumed once connected.
                    self.scanner.clear();
                    self.refresh_devices();
                    let started_at = Utc::now();
                    self.session = Some(ActiveSession {
                        device_id: device_id.clone(),
                        started_at,
                        started: Instant::now(),
                    });
                    info!("Session started with {}", device_id);
                    self.session_subscribers.notify(&SessionEvent::Started {
                        device_id,
                        started_at,
                    });
                }
                Action::SessionEnded(device_id, reason) => {
                    let Some(session) = self.session.take() else {
                        continue;
                    };
                    if session.device_id != device_id {
                        warn!(
                            "Session bookkeeping mismatch: {} vs {}",
                            session.device_id, device_id
                        );
                    }
                    let duration = session.started.elapsed();
                    info!(
                        "Session with {} ended after {:?} ({:?})",
                        device_id, duration, reason
                    );
                    self.session_subscribers.notify(&SessionEvent::Ended {
                        device_id,
                        started_at: session.started_at,
                        duration,
                        reason,
                    });
                }
            }
        }
    }
}

//! Connection lifecycle of the yoga mat link
//! A sans-IO state machine: every input returns the [`Action`]s the session
//! actor has to carry out against the platform, timers and subscribers.

use std::time::Duration;

use log::{info, warn};

use crate::core::bluetooth::error::{CancelError, ConnectError, GateError};
use crate::core::bluetooth::timers::TimerKind;
use crate::core::bluetooth::types::{ConnectionPhase, DeviceId, EndReason, ErrorKind};

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect(DeviceId),
    Disconnect(DeviceId),
    ArmTimer(TimerKind, Duration),
    CancelTimer(TimerKind),
    SessionStarted(DeviceId),
    SessionEnded(DeviceId, EndReason),
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// `base * 2^attempt_index`, capped at `max_delay`.
    pub fn delay(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub struct ConnectionLifecycle {
    phase: ConnectionPhase,
    /// Device holding the link; set only in Connected/Reconnecting/Disconnecting
    active: Option<DeviceId>,
    /// Device of the current or most recent link attempt
    target: Option<DeviceId>,
    /// Failures in the current link-loss episode
    failures: u32,
    last_error: Option<ErrorKind>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
}

impl ConnectionLifecycle {
    pub fn new(
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        disconnect_timeout: Duration,
    ) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            active: None,
            target: None,
            failures: 0,
            last_error: None,
            policy,
            connect_timeout,
            disconnect_timeout,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn active_device(&self) -> Option<&DeviceId> {
        self.active.as_ref()
    }

    pub fn last_target(&self) -> Option<&DeviceId> {
        self.target.as_ref()
    }

    pub fn last_error(&self) -> Option<&ErrorKind> {
        self.last_error.as_ref()
    }

    pub fn set_last_error(&mut self, error: Option<ErrorKind>) {
        self.last_error = error;
    }

    /// `active_device` is set exactly when the phase holds a link.
    pub fn invariant_holds(&self) -> bool {
        self.active.is_some() == self.phase.holds_link()
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        if self.phase != phase {
            info!("Connection phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    pub fn enter_scanning(&mut self) {
        self.last_error = None;
        self.set_phase(ConnectionPhase::Scanning);
    }

    /// Scan ended without a selection.
    pub fn leave_scanning(&mut self) {
        if self.phase == ConnectionPhase::Scanning {
            self.set_phase(ConnectionPhase::Idle);
        }
    }

    /// Starts a link attempt. Any previous error is cleared.
    pub fn connect(&mut self, id: DeviceId) -> Vec<Action> {
        info!("Connecting to {}", id);
        self.last_error = None;
        self.active = None;
        self.failures = 0;
        self.target = Some(id.clone());
        self.set_phase(ConnectionPhase::Connecting);
        vec![
            Action::Connect(id),
            Action::ArmTimer(TimerKind::ConnectTimeout, self.connect_timeout),
        ]
    }

    /// The platform reports the link is up.
    pub fn on_link_up(&mut self, id: &str) -> Vec<Action> {
        match self.phase {
            ConnectionPhase::Connecting if self.target.as_deref() == Some(id) => {
                info!("Connected to {}", id);
                self.active = Some(id.to_string());
                self.failures = 0;
                self.set_phase(ConnectionPhase::Connected);
                vec![
                    Action::CancelTimer(TimerKind::ConnectTimeout),
                    Action::SessionStarted(id.to_string()),
                ]
            }
            ConnectionPhase::Reconnecting if self.active.as_deref() == Some(id) => {
                info!("Link to {} re-established", id);
                self.failures = 0;
                self.set_phase(ConnectionPhase::Connected);
                vec![
                    Action::CancelTimer(TimerKind::ConnectTimeout),
                    Action::CancelTimer(TimerKind::ReconnectBackoff),
                ]
            }
            ConnectionPhase::Connected | ConnectionPhase::Disconnecting
                if self.active.as_deref() == Some(id) =>
            {
                Vec::new()
            }
            _ => {
                // Late answer to an attempt that was cancelled or timed out.
                warn!("Dropping unexpected link to {} in {:?}", id, self.phase);
                vec![Action::Disconnect(id.to_string())]
            }
        }
    }

    /// The platform reports the link is down.
    pub fn on_link_down(&mut self, id: &str, reason: Option<&str>) -> Vec<Action> {
        match self.phase {
            ConnectionPhase::Connected if self.active.as_deref() == Some(id) => {
                warn!("Lost link to {} ({})", id, reason.unwrap_or("no reason given"));
                self.record_reconnect_failure()
            }
            ConnectionPhase::Reconnecting if self.active.as_deref() == Some(id) => {
                self.record_reconnect_failure()
            }
            ConnectionPhase::Disconnecting if self.active.as_deref() == Some(id) => {
                info!("Disconnected from {}", id);
                self.active = None;
                self.set_phase(ConnectionPhase::Idle);
                vec![
                    Action::CancelTimer(TimerKind::DisconnectTimeout),
                    Action::SessionEnded(id.to_string(), EndReason::UserDisconnect),
                ]
            }
            ConnectionPhase::Connecting if self.target.as_deref() == Some(id) => {
                let reason = reason.unwrap_or("link dropped while connecting").to_string();
                self.fail_attempt(ConnectError::Refused(reason).into())
            }
            _ => Vec::new(),
        }
    }

    /// A link attempt was refused, either by an event or by the request itself.
    pub fn on_connect_failed(&mut self, id: &str, error: ErrorKind) -> Vec<Action> {
        match self.phase {
            ConnectionPhase::Connecting if self.target.as_deref() == Some(id) => {
                self.fail_attempt(error)
            }
            ConnectionPhase::Reconnecting if self.active.as_deref() == Some(id) => {
                warn!("Reconnect attempt to {} failed: {:?}", id, error);
                self.record_reconnect_failure()
            }
            _ => Vec::new(),
        }
    }

    pub fn on_timer(&mut self, kind: TimerKind) -> Vec<Action> {
        match (kind, self.phase) {
            (TimerKind::ConnectTimeout, ConnectionPhase::Connecting) => {
                warn!("Connection attempt timed out after {:?}", self.connect_timeout);
                let mut actions = self.fail_attempt(ConnectError::Timeout.into());
                if let Some(id) = &self.target {
                    actions.push(Action::Disconnect(id.clone()));
                }
                actions
            }
            (TimerKind::ConnectTimeout, ConnectionPhase::Reconnecting) => {
                self.record_reconnect_failure()
            }
            (TimerKind::ReconnectBackoff, ConnectionPhase::Reconnecting) => {
                match &self.active {
                    Some(id) => {
                        info!("Reconnect attempt {} to {}", self.failures, id);
                        vec![
                            Action::Connect(id.clone()),
                            Action::ArmTimer(TimerKind::ConnectTimeout, self.connect_timeout),
                        ]
                    }
                    None => Vec::new(),
                }
            }
            (TimerKind::DisconnectTimeout, ConnectionPhase::Disconnecting) => {
                warn!("Disconnect was not confirmed, releasing link");
                self.release(EndReason::UserDisconnect, ConnectionPhase::Idle)
            }
            _ => Vec::new(),
        }
    }

    /// User disconnect. Once requested, no reconnect is attempted for the link.
    pub fn disconnect(&mut self) -> Vec<Action> {
        match self.phase {
            ConnectionPhase::Connected => {
                let Some(id) = self.active.clone() else {
                    return Vec::new();
                };
                info!("Disconnecting from {}", id);
                self.set_phase(ConnectionPhase::Disconnecting);
                vec![
                    Action::Disconnect(id),
                    Action::ArmTimer(TimerKind::DisconnectTimeout, self.disconnect_timeout),
                ]
            }
            ConnectionPhase::Reconnecting => {
                let mut actions = self.release(EndReason::UserDisconnect, ConnectionPhase::Idle);
                if let Some(id) = &self.target {
                    actions.push(Action::Disconnect(id.clone()));
                }
                actions
            }
            ConnectionPhase::Connecting => self.abort_attempt(),
            _ => Vec::new(),
        }
    }

    /// Aborts whatever is in flight. Scanning is stopped by the caller.
    pub fn cancel(&mut self) -> Result<Vec<Action>, CancelError> {
        match self.phase {
            ConnectionPhase::Scanning => {
                self.set_phase(ConnectionPhase::Idle);
                Ok(Vec::new())
            }
            ConnectionPhase::Connecting => Ok(self.abort_attempt()),
            ConnectionPhase::Reconnecting => {
                let mut actions = self.release(EndReason::Cancelled, ConnectionPhase::Idle);
                if let Some(id) = &self.target {
                    actions.push(Action::Disconnect(id.clone()));
                }
                Ok(actions)
            }
            _ => Err(CancelError::NothingToCancel),
        }
    }

    /// The adapter went away. Takes priority over anything in flight.
    pub fn adapter_lost(&mut self, error: GateError) -> Vec<Action> {
        let mut actions = vec![
            Action::CancelTimer(TimerKind::ConnectTimeout),
            Action::CancelTimer(TimerKind::ReconnectBackoff),
            Action::CancelTimer(TimerKind::DisconnectTimeout),
        ];
        match self.phase {
            ConnectionPhase::Connected | ConnectionPhase::Reconnecting => {
                self.last_error = Some(error.into());
                actions.extend(self.release(EndReason::AdapterLost, ConnectionPhase::Failed));
            }
            ConnectionPhase::Connecting => {
                self.last_error = Some(error.into());
                self.set_phase(ConnectionPhase::Failed);
            }
            ConnectionPhase::Disconnecting => {
                actions.extend(self.release(EndReason::UserDisconnect, ConnectionPhase::Idle));
            }
            ConnectionPhase::Scanning => self.set_phase(ConnectionPhase::Idle),
            ConnectionPhase::Idle | ConnectionPhase::Failed => {}
        }
        actions
    }

    /// Releases the link before the session manager stops.
    pub fn shutdown(&mut self) -> Vec<Action> {
        let target = self.target.clone();
        let mut actions = match self.phase {
            ConnectionPhase::Connected
            | ConnectionPhase::Reconnecting
            | ConnectionPhase::Disconnecting => {
                self.release(EndReason::Shutdown, ConnectionPhase::Idle)
            }
            ConnectionPhase::Connecting => {
                self.set_phase(ConnectionPhase::Idle);
                Vec::new()
            }
            _ => return Vec::new(),
        };
        if let Some(id) = target {
            actions.push(Action::Disconnect(id));
        }
        actions
    }

    fn record_reconnect_failure(&mut self) -> Vec<Action> {
        self.failures += 1;
        let mut actions = vec![
            Action::CancelTimer(TimerKind::ConnectTimeout),
            Action::CancelTimer(TimerKind::ReconnectBackoff),
        ];
        if self.failures >= self.policy.max_attempts {
            warn!("Giving up after {} reconnect failures", self.failures);
            self.last_error = Some(
                ConnectError::ReconnectExhausted {
                    attempts: self.failures,
                }
                .into(),
            );
            actions.extend(self.release(EndReason::ReconnectExhausted, ConnectionPhase::Failed));
            return actions;
        }

        let delay = self.policy.delay(self.failures - 1);
        info!(
            "Reconnecting in {:?} (failure {} of {})",
            delay, self.failures, self.policy.max_attempts
        );
        self.set_phase(ConnectionPhase::Reconnecting);
        actions.push(Action::ArmTimer(TimerKind::ReconnectBackoff, delay));
        actions
    }

    fn fail_attempt(&mut self, error: ErrorKind) -> Vec<Action> {
        warn!("Connection attempt failed: {:?}", error);
        self.last_error = Some(error);
        self.set_phase(ConnectionPhase::Failed);
        vec![Action::CancelTimer(TimerKind::ConnectTimeout)]
    }

    fn abort_attempt(&mut self) -> Vec<Action> {
        self.set_phase(ConnectionPhase::Idle);
        let mut actions = vec![Action::CancelTimer(TimerKind::ConnectTimeout)];
        if let Some(id) = &self.target {
            actions.push(Action::Disconnect(id.clone()));
        }
        actions
    }

    /// Drops the active link and ends the session.
    fn release(&mut self, reason: EndReason, next: ConnectionPhase) -> Vec<Action> {
        let mut actions = vec![
            Action::CancelTimer(TimerKind::ConnectTimeout),
            Action::CancelTimer(TimerKind::ReconnectBackoff),
            Action::CancelTimer(TimerKind::DisconnectTimeout),
        ];
        self.failures = 0;
        self.set_phase(next);
        if let Some(id) = self.active.take() {
            actions.push(Action::SessionEnded(id, reason));
        }
        actions
    }
}

//! Practice session history
//! Keeps totals and the most recent finished sessions in memory, fed by the
//! session manager's start/end events.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;

use crate::core::bluetooth::{DeviceId, EndReason, SessionEvent};

/// A finished session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub device_id: DeviceId,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub reason: EndReason,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistory {
    total_sessions: u64,
    total_connected: Duration,
    /// Device of the session in progress
    current: Option<DeviceId>,
    /// Newest first
    recent: VecDeque<SessionRecord>,
    #[serde(skip)]
    limit: usize,
}

impl SessionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            total_sessions: 0,
            total_connected: Duration::ZERO,
            current: None,
            recent: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Started { device_id, .. } => {
                self.current = Some(device_id.clone());
            }
            SessionEvent::Ended {
                device_id,
                started_at,
                duration,
                reason,
            } => {
                self.current = None;
                self.total_sessions += 1;
                self.total_connected += *duration;
                if self.limit == 0 {
                    return;
                }
                if self.recent.len() == self.limit {
                    self.recent.pop_back();
                }
                self.recent.push_front(SessionRecord {
                    device_id: device_id.clone(),
                    started_at: *started_at,
                    duration: *duration,
                    reason: *reason,
                });
                debug!("Recorded session #{} with {}", self.total_sessions, device_id);
            }
        }
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions
    }

    pub fn total_connected(&self) -> Duration {
        self.total_connected
    }

    pub fn in_session(&self) -> bool {
        self.current.is_some()
    }

    pub fn recent(&self) -> impl Iterator<Item = &SessionRecord> {
        self.recent.iter()
    }
}

use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::ReconnectPolicy;
use crate::core::bluetooth::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_DISCONNECT_TIMEOUT_MS, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_BASE_DELAY_MS, DEFAULT_RECONNECT_MAX_DELAY_MS, DEFAULT_SCAN_BATCH_WINDOW_MS,
    DEFAULT_SCAN_TIMEOUT_MS, MIN_RSSI_THRESHOLD,
};

/// Timing and filtering of the BLE session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Scan window used when the caller does not pass one
    pub scan_timeout_ms: u64,
    /// Budget for one connection attempt
    pub connect_timeout_ms: u64,
    /// How long a disconnect may stay unconfirmed
    pub disconnect_timeout_ms: u64,
    /// Link-loss failures tolerated before giving up
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubled for each further failure
    pub reconnect_base_delay_ms: u64,
    /// Cap of the reconnect delay
    pub reconnect_max_delay_ms: u64,
    /// Discovery events within this window are published as one update
    pub scan_batch_window_ms: u64,
    /// Advertisements weaker than this are ignored
    pub min_rssi: i16,
    /// Only devices whose advertised name matches are listed
    pub device_name_pattern: Option<String>,
    /// GATT services a scan is filtered on when the caller passes none
    pub service_filter: Vec<Uuid>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            scan_batch_window_ms: DEFAULT_SCAN_BATCH_WINDOW_MS,
            min_rssi: MIN_RSSI_THRESHOLD,
            device_name_pattern: None,
            service_filter: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay_ms = base.as_millis() as u64;
        self.reconnect_max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_device_name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.device_name_pattern = Some(pattern.into());
        self
    }

    pub fn with_min_rssi(mut self, rssi: i16) -> Self {
        self.min_rssi = rssi;
        self
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn scan_batch_window(&self) -> Duration {
        Duration::from_millis(self.scan_batch_window_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    /// Compiled device name filter.
    pub fn name_filter(&self) -> Result<Option<Regex>> {
        self.device_name_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("Invalid device name pattern: {}", pattern))
            })
            .transpose()
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            bail!("Scan and connect timeouts must be positive");
        }
        if self.disconnect_timeout_ms == 0 || self.scan_batch_window_ms == 0 {
            bail!("Disconnect timeout and scan batch window must be positive");
        }
        if self.max_reconnect_attempts == 0 {
            bail!("max_reconnect_attempts must be at least 1");
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            bail!(
                "Reconnect base delay ({} ms) exceeds the maximum delay ({} ms)",
                self.reconnect_base_delay_ms,
                self.reconnect_max_delay_ms
            );
        }
        self.name_filter()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect_policy().max_attempts, 3);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(SessionConfig::new().with_max_reconnect_attempts(0).validate().is_err());
        assert!(
            SessionConfig::new()
                .with_scan_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            SessionConfig::new()
                .with_reconnect_delays(Duration::from_secs(10), Duration::from_secs(1))
                .validate()
                .is_err()
        );
        assert!(
            SessionConfig::new()
                .with_device_name_pattern("(unclosed")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "connect_timeout_ms": 2500 }"#).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(config.scan_timeout_ms, DEFAULT_SCAN_TIMEOUT_MS);
    }
}

//! Constants used throughout the application
//! This module contains the default timing values of the session manager
//! and the name the yoga mat advertises with.

/// Advertised name prefix of the Smart Yoga Mat
pub const MAT_NAME_PREFIX: &str = "SmartMat";

/// Scan duration in milliseconds
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 5000;

/// Budget for a single connection attempt in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// How long to wait for the platform to confirm a disconnect
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of reconnect failures before giving up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// First reconnect backoff delay in milliseconds
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Upper bound of the reconnect backoff delay in milliseconds
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Discovery events arriving within this window are published together
pub const DEFAULT_SCAN_BATCH_WINDOW_MS: u64 = 250;

/// Advertisements weaker than this are ignored
pub const MIN_RSSI_THRESHOLD: i16 = -100;

/// Number of finished sessions kept by the history store
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

//! Core functionality of the yoga mat companion
//! This module contains the BLE session layer the UI drives.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{SessionManager, SessionState};

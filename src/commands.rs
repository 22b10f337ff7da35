//! Tauri commands
//! This module defines all the commands that can be invoked from the frontend.
//! State changes are pushed separately as "session-state" and
//! "session-event" events.

use std::time::Duration;

use tauri::State;

use crate::core::bluetooth::{Ready, SessionState};
use crate::history::SessionHistory;
use crate::state::AppState;

/// Checks adapter power and permission, prompting for permission once.
#[tauri::command]
pub async fn check_readiness(app_state: State<'_, AppState>) -> Result<Ready, String> {
    app_state
        .session_manager
        .check_readiness()
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn enable_bluetooth(app_state: State<'_, AppState>) -> Result<(), String> {
    app_state
        .session_manager
        .enable_radio()
        .await
        .map_err(|e| e.to_string())
}

/// Starts discovery
///
/// # Arguments
/// * `timeout_ms` - Scan window; the configured default when omitted
/// * `app_state` - The application state
#[tauri::command]
pub async fn start_scan(
    timeout_ms: Option<u64>,
    app_state: State<'_, AppState>,
) -> Result<(), String> {
    app_state
        .session_manager
        .start_scan(None, timeout_ms.map(Duration::from_millis))
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn stop_scan(app_state: State<'_, AppState>) -> Result<(), String> {
    app_state
        .session_manager
        .stop_scan()
        .await
        .map_err(|e| e.to_string())
}

/// Connects to a mat
///
/// # Arguments
/// * `device_id` - Id from the device list; without it the strongest mat is picked
/// * `app_state` - The application state
#[tauri::command]
pub async fn connect_device(
    device_id: Option<String>,
    app_state: State<'_, AppState>,
) -> Result<(), String> {
    app_state
        .session_manager
        .connect(device_id)
        .await
        .map_err(|e| e.to_string())
}

/// Disconnects from the currently connected mat
#[tauri::command]
pub async fn disconnect(app_state: State<'_, AppState>) -> Result<(), String> {
    app_state
        .session_manager
        .disconnect()
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn cancel(app_state: State<'_, AppState>) -> Result<(), String> {
    app_state
        .session_manager
        .cancel()
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn get_session_state(app_state: State<'_, AppState>) -> SessionState {
    app_state.session_manager.get_state()
}

#[tauri::command]
pub fn get_session_history(app_state: State<'_, AppState>) -> SessionHistory {
    app_state.history()
}

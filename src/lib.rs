//! Smart Yoga Mat companion library
//! The BLE session layer of the companion app plus the tauri shell that
//! exposes it to the webview.

// Module declarations
#[cfg(feature = "app")]
pub mod commands;
pub mod config;
pub mod core;
pub mod history;
pub mod logging;
pub mod state;
pub mod utils;

#[cfg(feature = "app")]
pub use app::run;

#[cfg(feature = "app")]
mod app {
    use anyhow::Result;
    use log::{error, info, warn};
    use serde::Serialize;
    use tauri::{AppHandle, Emitter, Manager, RunEvent};

    use crate::commands::{
        cancel, check_readiness, connect_device, disconnect, enable_bluetooth,
        get_session_history, get_session_state, start_scan, stop_scan,
    };
    use crate::config::AppConfig;
    use crate::core::bluetooth::{BluestPlatform, MAT_NAME_PREFIX, SessionManager};
    use crate::logging::{self, TauriLogger};
    use crate::state::AppState;

    pub const SESSION_STATE_EVENT: &str = "session-state";
    pub const SESSION_EVENT: &str = "session-event";

    fn emit<T: Serialize + Clone>(app_handle: &AppHandle, event: &str, payload: &T) {
        if let Err(e) = app_handle.emit(event, payload.clone()) {
            error!("Failed to emit {} event: {}", event, e);
        }
    }

    async fn build_state(app_handle: AppHandle) -> Result<AppState> {
        let config_path = AppConfig::file_path(&app_handle)?;
        let mut config = match AppConfig::load_config(&config_path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring unreadable config {:?}: {}", config_path, e);
                AppConfig::default()
            }
        };
        if config.session.device_name_pattern.is_none() {
            config.session.device_name_pattern = Some(format!("^{}", MAT_NAME_PREFIX));
        }

        let (platform, events) = BluestPlatform::new().await?;
        let manager = SessionManager::spawn(platform, events, config.session.clone())?;
        let mut state = AppState::new(manager.clone(), config.history_limit);

        let handle = app_handle.clone();
        state.retain(manager.subscribe(move |snapshot| {
            emit(&handle, SESSION_STATE_EVENT, snapshot);
        }));
        let handle = app_handle.clone();
        state.retain(manager.subscribe_session_events(move |event| {
            emit(&handle, SESSION_EVENT, event);
        }));
        Ok(state)
    }

    #[cfg_attr(mobile, tauri::mobile_entry_point)]
    pub fn run() {
        let builder = tauri::Builder::default();
        #[cfg(desktop)]
        let builder = builder.plugin(tauri_plugin_single_instance::init(|app, _args, _cwd| {
            if let Some(window) = app.get_webview_window("main") {
                let _ = window.show();
                let _ = window.set_focus();
            }
        }));

        let app = builder
            // Register our commands
            .invoke_handler(tauri::generate_handler![
                check_readiness,
                enable_bluetooth,
                start_scan,
                stop_scan,
                connect_device,
                disconnect,
                cancel,
                get_session_state,
                get_session_history
            ])
            // Setup our application state
            .setup(|app| {
                if TauriLogger::init(app.handle().clone(), log::Level::Info).is_err() {
                    logging::init();
                }
                info!("Starting AppState initialization in Tauri setup.");
                let app_state =
                    tauri::async_runtime::block_on(build_state(app.handle().clone()))?;
                app.manage(app_state);
                Ok(())
            })
            .build(tauri::generate_context!());

        let app = match app {
            Ok(app) => app,
            Err(e) => {
                logging::init();
                error!("Error while building tauri application: {}", e);
                return;
            }
        };

        app.run(|app_handle, event| {
            if let RunEvent::ExitRequested { .. } = event {
                if let Some(state) = app_handle.try_state::<AppState>() {
                    let manager = state.session_manager.clone();
                    if let Err(e) = tauri::async_runtime::block_on(manager.shutdown()) {
                        warn!("Session manager shutdown: {}", e);
                    }
                }
            }
        });
    }
}

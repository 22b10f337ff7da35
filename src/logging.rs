//! Logging setup
//! env_logger everywhere; the desktop shell additionally forwards records to
//! the webview as "log-message" events.

/// Installs env_logger, at Info unless `RUST_LOG` says otherwise.
/// Later calls are no-ops.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[cfg(feature = "app")]
pub use tauri_logger::{LogMessage, TauriLogger};

#[cfg(feature = "app")]
mod tauri_logger {
    use chrono::Local;
    use log::{Level, Log, Metadata, Record, SetLoggerError};
    use serde::Serialize;
    use tauri::Emitter;

    pub const LOG_EVENT: &str = "log-message";

    #[derive(Debug, Serialize, Clone)]
    pub struct LogMessage {
        level: String,
        message: String,
        timestamp: String,
    }

    pub struct TauriLogger {
        app_handle: tauri::AppHandle,
        level: Level,
        console: env_logger::Logger,
    }

    impl TauriLogger {
        pub fn new(app_handle: tauri::AppHandle, level: Level) -> Self {
            let console = env_logger::Builder::new()
                .filter_level(level.to_level_filter())
                .build();
            Self {
                app_handle,
                level,
                console,
            }
        }

        pub fn init(app_handle: tauri::AppHandle, level: Level) -> Result<(), SetLoggerError> {
            let logger = TauriLogger::new(app_handle, level);
            log::set_boxed_logger(Box::new(logger))
                .map(|()| log::set_max_level(level.to_level_filter()))
        }

        fn emit_log(&self, record: &Record) {
            let log_message = LogMessage {
                level: record.level().to_string(),
                message: record.args().to_string(),
                timestamp: Local::now().to_rfc3339(),
            };
            // Logging the failure would recurse.
            let _ = self.app_handle.emit(LOG_EVENT, log_message);
        }
    }

    impl Log for TauriLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                self.console.log(record);
                self.emit_log(record);
            }
        }

        fn flush(&self) {
            self.console.flush();
        }
    }
}

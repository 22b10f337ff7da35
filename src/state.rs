//! Application state management
//! This module defines the state shared by the tauri commands.

use std::sync::{Arc, Mutex, PoisonError};

use log::info;

use crate::core::bluetooth::{SessionManager, Subscription};
use crate::history::SessionHistory;

/// Global application state
pub struct AppState {
    /// The session manager instance
    pub session_manager: SessionManager,
    history: Arc<Mutex<SessionHistory>>,
    /// Subscriptions living as long as the app
    subscriptions: Vec<Subscription>,
}

impl AppState {
    /// Creates the state and starts feeding the history store.
    pub fn new(session_manager: SessionManager, history_limit: usize) -> Self {
        info!("Initializing AppState (history limit {})", history_limit);
        let history = Arc::new(Mutex::new(SessionHistory::new(history_limit)));
        let sink = history.clone();
        let feed = session_manager.subscribe_session_events(move |event| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(event);
        });
        Self {
            session_manager,
            history,
            subscriptions: vec![feed],
        }
    }

    /// Keeps `subscription` registered for the lifetime of the state.
    pub fn retain(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Copy of the session history.
    pub fn history(&self) -> SessionHistory {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

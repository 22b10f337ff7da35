use std::sync::{Arc, Mutex};
use std::time::Duration;

use yogamat_companion_lib::config::session_config::SessionConfig;
use yogamat_companion_lib::core::bluetooth::{
    AdapterState, CancelError, CommandError, ConnectError, ConnectionPhase, EndReason, ErrorKind,
    GateError, PermissionState, PlatformCall, ScanError, SessionEvent, SessionManager, SessionState,
    SimulatedPlatform, SimulatorHandle, Subscription,
};
use yogamat_companion_lib::state::AppState;

fn start(config: SessionConfig) -> (SessionManager, SimulatorHandle) {
    let (platform, sim, events) = SimulatedPlatform::new();
    let manager = SessionManager::spawn(platform, events, config).unwrap();
    (manager, sim)
}

async fn wait_for<F>(manager: &SessionManager, predicate: F) -> SessionState
where
    F: Fn(&SessionState) -> bool,
{
    let mut rx = manager.watch_state();
    let state = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| predicate(s)))
        .await
        .expect("state never matched")
        .expect("session manager stopped")
        .clone();
    state
}

async fn wait_for_phase(manager: &SessionManager, phase: ConnectionPhase) -> SessionState {
    wait_for(manager, |s| s.connection == phase).await
}

/// Lets queued platform events reach the session task.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn discover(manager: &SessionManager, sim: &SimulatorHandle, id: &str, rssi: i16) {
    manager.start_scan(None, None).await.unwrap();
    sim.discover(id, Some("SmartMat Pro"), rssi);
    wait_for(manager, |s| s.devices.iter().any(|d| d.id == id)).await;
}

async fn connected(manager: &SessionManager, sim: &SimulatorHandle, id: &str) {
    discover(manager, sim, id, -50).await;
    manager.connect(Some(id.to_string())).await.unwrap();
    sim.link_up(id);
    wait_for_phase(manager, ConnectionPhase::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn scan_connect_disconnect_round_trip() {
    let (manager, sim) = start(SessionConfig::default());

    discover(&manager, &sim, "mat-1", -48).await;
    assert_eq!(manager.get_state().connection, ConnectionPhase::Scanning);

    manager.connect(Some("mat-1".to_string())).await.unwrap();
    let state = manager.get_state();
    assert_eq!(state.connection, ConnectionPhase::Connecting);
    assert_eq!(state.active_device_id, None);

    sim.link_up("mat-1");
    let state = wait_for_phase(&manager, ConnectionPhase::Connected).await;
    assert_eq!(state.active_device_id.as_deref(), Some("mat-1"));
    assert!(state.devices.is_empty());

    manager.disconnect().await.unwrap();
    assert_eq!(manager.get_state().connection, ConnectionPhase::Disconnecting);
    assert_eq!(sim.disconnect_calls(), vec!["mat-1".to_string()]);

    sim.link_lost("mat-1");
    let state = wait_for_phase(&manager, ConnectionPhase::Idle).await;
    assert_eq!(state.active_device_id, None);
    assert_eq!(state.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_fails_and_retry_reuses_target() {
    let (manager, sim) = start(SessionConfig::default());
    discover(&manager, &sim, "mat-1", -60).await;

    manager.connect(Some("mat-1".to_string())).await.unwrap();
    let state = wait_for_phase(&manager, ConnectionPhase::Failed).await;
    assert_eq!(state.last_error, Some(ErrorKind::Connect(ConnectError::Timeout)));
    assert_eq!(state.active_device_id, None);
    // The abandoned attempt is torn down.
    assert_eq!(sim.disconnect_calls(), vec!["mat-1".to_string()]);

    manager.connect(None).await.unwrap();
    let state = manager.get_state();
    assert_eq!(state.connection, ConnectionPhase::Connecting);
    assert_eq!(state.last_error, None);
    assert_eq!(sim.connect_calls(), vec!["mat-1".to_string(), "mat-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_max_attempts() {
    let (manager, sim) = start(SessionConfig::default().with_max_reconnect_attempts(3));
    connected(&manager, &sim, "mat-1").await;

    sim.link_lost("mat-1");
    let state = wait_for_phase(&manager, ConnectionPhase::Reconnecting).await;
    assert_eq!(state.active_device_id.as_deref(), Some("mat-1"));

    let state = wait_for_phase(&manager, ConnectionPhase::Failed).await;
    assert_eq!(
        state.last_error,
        Some(ErrorKind::Connect(ConnectError::ReconnectExhausted { attempts: 3 }))
    );
    assert_eq!(state.active_device_id, None);
    // Initial connect plus two retries.
    assert_eq!(sim.connect_calls().len(), 3);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(sim.connect_calls().len(), 3);
    assert_eq!(manager.get_state().connection, ConnectionPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_the_same_session() {
    let (manager, sim) = start(SessionConfig::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _sub = manager.subscribe_session_events(move |e| sink.lock().unwrap().push(e.clone()));

    connected(&manager, &sim, "mat-1").await;
    sim.link_lost("mat-1");
    wait_for_phase(&manager, ConnectionPhase::Reconnecting).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(sim.connect_calls().len(), 2);
    sim.link_up("mat-1");
    let state = wait_for_phase(&manager, ConnectionPhase::Connected).await;
    assert_eq!(state.active_device_id.as_deref(), Some("mat-1"));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], SessionEvent::Started { .. }));
}

#[tokio::test(start_paused = true)]
async fn late_link_after_cancel_is_dropped() {
    let (manager, sim) = start(SessionConfig::default());
    discover(&manager, &sim, "mat-1", -55).await;

    manager.connect(Some("mat-1".to_string())).await.unwrap();
    manager.cancel().await.unwrap();
    assert_eq!(manager.get_state().connection, ConnectionPhase::Idle);

    sim.link_up("mat-1");
    settle().await;

    let state = manager.get_state();
    assert_eq!(state.connection, ConnectionPhase::Idle);
    assert_eq!(state.active_device_id, None);
    assert_eq!(
        sim.disconnect_calls(),
        vec!["mat-1".to_string(), "mat-1".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn rediscovery_updates_entry_in_place() {
    let (manager, sim) = start(SessionConfig::default());
    manager.start_scan(None, None).await.unwrap();

    sim.discover("mat-a", Some("SmartMat A"), -70);
    sim.discover("mat-b", Some("SmartMat B"), -40);
    sim.discover("mat-a", None, -30);

    let state = wait_for(&manager, |s| s.devices.len() == 2).await;
    let ids: Vec<&str> = state.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["mat-a", "mat-b"]);
    assert_eq!(state.devices[0].signal_strength, -30);
    assert_eq!(state.devices[0].display_name.as_deref(), Some("SmartMat A"));
}

#[tokio::test(start_paused = true)]
async fn discovery_filters_apply() {
    let config = SessionConfig::default()
        .with_device_name_pattern("^SmartMat")
        .with_min_rssi(-80);
    let (manager, sim) = start(config);
    manager.start_scan(None, None).await.unwrap();

    sim.discover("speaker", Some("Living Room"), -40);
    sim.discover("far-mat", Some("SmartMat Far"), -95);
    sim.discover("mat-1", Some("SmartMat One"), -60);

    let state = wait_for(&manager, |s| !s.devices.is_empty()).await;
    assert_eq!(state.devices.len(), 1);
    assert_eq!(state.devices[0].id, "mat-1");
}

#[tokio::test(start_paused = true)]
async fn overlapping_commands_are_rejected() {
    let (manager, sim) = start(SessionConfig::default());
    discover(&manager, &sim, "mat-1", -50).await;
    sim.discover("mat-2", Some("SmartMat Two"), -52);
    wait_for(&manager, |s| s.devices.len() == 2).await;

    manager.connect(Some("mat-1".to_string())).await.unwrap();
    assert_eq!(
        manager.connect(Some("mat-2".to_string())).await,
        Err(CommandError::ConcurrentCommand)
    );
    assert_eq!(sim.connect_calls(), vec!["mat-1".to_string()]);

    let (first, second) = tokio::join!(manager.check_readiness(), manager.check_readiness());
    assert!(first.is_ok());
    assert_eq!(second, Err(CommandError::ConcurrentCommand));
}

#[tokio::test(start_paused = true)]
async fn readiness_prompts_only_once() {
    let (manager, sim) = start(SessionConfig::default());

    manager.check_readiness().await.unwrap();
    manager.check_readiness().await.unwrap();
    manager.check_readiness().await.unwrap();

    assert_eq!(sim.permission_prompts(), 1);
    let state = manager.get_state();
    assert_eq!(state.permission, PermissionState::Granted);
    assert_eq!(state.adapter, AdapterState::PoweredOn);
}

#[tokio::test(start_paused = true)]
async fn denied_permission_blocks_scanning() {
    let (manager, sim) = start(SessionConfig::default());
    sim.set_permission_answer(PermissionState::Denied);

    assert_eq!(
        manager.start_scan(None, None).await,
        Err(CommandError::Scan(ScanError::NotReady(GateError::PermissionDenied)))
    );
    assert_eq!(manager.get_state().connection, ConnectionPhase::Idle);
    assert_eq!(manager.get_state().permission, PermissionState::Denied);

    // Granted later in system settings; no second prompt.
    sim.set_permission_answer(PermissionState::Granted);
    manager.check_readiness().await.unwrap();
    assert_eq!(sim.permission_prompts(), 1);
}

#[tokio::test(start_paused = true)]
async fn powered_off_radio_is_reported_and_can_be_enabled() {
    let (platform, sim, events) = SimulatedPlatform::new();
    sim.set_adapter_state(AdapterState::PoweredOff);
    let manager = SessionManager::spawn(platform, events, SessionConfig::default()).unwrap();

    assert_eq!(
        manager.start_scan(None, None).await,
        Err(CommandError::Scan(ScanError::NotReady(GateError::AdapterOff)))
    );

    manager.enable_radio().await.unwrap();
    wait_for(&manager, |s| s.adapter == AdapterState::PoweredOn).await;
    manager.start_scan(None, None).await.unwrap();
    assert_eq!(manager.get_state().connection, ConnectionPhase::Scanning);
}

#[tokio::test(start_paused = true)]
async fn adapter_loss_ends_the_session() {
    let (manager, sim) = start(SessionConfig::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _sub = manager.subscribe_session_events(move |e| sink.lock().unwrap().push(e.clone()));
    connected(&manager, &sim, "mat-1").await;

    sim.change_adapter_state(AdapterState::PoweredOff);
    let state = wait_for_phase(&manager, ConnectionPhase::Failed).await;
    assert_eq!(state.adapter, AdapterState::PoweredOff);
    assert_eq!(state.active_device_id, None);
    assert_eq!(state.last_error, Some(ErrorKind::Gate(GateError::AdapterOff)));

    let events = events.lock().unwrap();
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Ended {
            reason: EndReason::AdapterLost,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn adapter_loss_while_scanning_returns_to_idle() {
    let (manager, sim) = start(SessionConfig::default());
    manager.start_scan(None, None).await.unwrap();

    sim.change_adapter_state(AdapterState::PoweredOff);
    let state = wait_for_phase(&manager, ConnectionPhase::Idle).await;
    assert_eq!(state.adapter, AdapterState::PoweredOff);
    assert_eq!(state.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn implicit_connect_picks_the_strongest_mat() {
    let (manager, sim) = start(SessionConfig::default());

    manager.connect(None).await.unwrap();
    assert_eq!(manager.get_state().connection, ConnectionPhase::Scanning);

    sim.discover("weak", Some("SmartMat Weak"), -85);
    sim.discover("strong", Some("SmartMat Strong"), -45);

    wait_for_phase(&manager, ConnectionPhase::Connecting).await;
    assert_eq!(sim.connect_calls(), vec!["strong".to_string()]);

    sim.link_up("strong");
    let state = wait_for_phase(&manager, ConnectionPhase::Connected).await;
    assert_eq!(state.active_device_id.as_deref(), Some("strong"));
}

#[tokio::test(start_paused = true)]
async fn implicit_connect_without_mats_reports_no_device() {
    let (manager, _sim) = start(SessionConfig::default());

    manager.connect(None).await.unwrap();
    let state = wait_for(&manager, |s| s.last_error.is_some()).await;
    assert_eq!(state.connection, ConnectionPhase::Idle);
    assert_eq!(
        state.last_error,
        Some(ErrorKind::Connect(ConnectError::NoDeviceFound))
    );
}

#[tokio::test(start_paused = true)]
async fn scan_times_out_and_keeps_results() {
    let config = SessionConfig::default().with_scan_timeout(Duration::from_secs(2));
    let (manager, sim) = start(config);
    discover(&manager, &sim, "mat-1", -50).await;

    let state = wait_for_phase(&manager, ConnectionPhase::Idle).await;
    assert_eq!(state.devices.len(), 1);

    // Still connectable from the last scan's results.
    manager.connect(Some("mat-1".to_string())).await.unwrap();
    assert_eq!(manager.get_state().connection, ConnectionPhase::Connecting);
}

#[tokio::test(start_paused = true)]
async fn invalid_requests_are_rejected() {
    let (manager, sim) = start(SessionConfig::default());

    assert_eq!(
        manager.start_scan(None, Some(Duration::ZERO)).await,
        Err(CommandError::Scan(ScanError::InvalidTimeout))
    );
    assert_eq!(
        manager.connect(Some("ghost".to_string())).await,
        Err(CommandError::Connect(ConnectError::UnknownDevice("ghost".to_string())))
    );
    assert_eq!(
        manager.cancel().await,
        Err(CommandError::Cancel(CancelError::NothingToCancel))
    );
    manager.stop_scan().await.unwrap();
    manager.disconnect().await.unwrap();

    manager.start_scan(None, None).await.unwrap();
    assert_eq!(
        manager.start_scan(None, None).await,
        Err(CommandError::Scan(ScanError::AlreadyScanning))
    );
    assert!(sim.connect_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connecting_elsewhere_while_connected_is_refused() {
    let (manager, sim) = start(SessionConfig::default());
    connected(&manager, &sim, "mat-1").await;

    manager.connect(Some("mat-1".to_string())).await.unwrap();
    assert_eq!(
        manager.connect(Some("mat-2".to_string())).await,
        Err(CommandError::Connect(ConnectError::AlreadyConnected(
            "mat-1".to_string()
        )))
    );
    assert_eq!(sim.connect_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn subscriber_can_unsubscribe_during_delivery() {
    let (manager, sim) = start(SessionConfig::default());
    let calls = Arc::new(Mutex::new(0));
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let calls_in_cb = calls.clone();
    let slot_in_cb = slot.clone();
    let subscription = manager.subscribe(move |_| {
        *calls_in_cb.lock().unwrap() += 1;
        if let Some(mut own) = slot_in_cb.lock().unwrap().take() {
            own.unsubscribe();
        }
    });
    *slot.lock().unwrap() = Some(subscription);

    discover(&manager, &sim, "mat-1", -50).await;
    manager.stop_scan().await.unwrap();
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn finished_sessions_reach_the_history() {
    let (manager, sim) = start(SessionConfig::default());
    let app_state = AppState::new(manager.clone(), 10);

    connected(&manager, &sim, "mat-1").await;
    assert!(app_state.history().in_session());

    tokio::time::sleep(Duration::from_secs(30)).await;
    manager.disconnect().await.unwrap();
    sim.link_lost("mat-1");
    wait_for_phase(&manager, ConnectionPhase::Idle).await;

    let history = app_state.history();
    assert!(!history.in_session());
    assert_eq!(history.total_sessions(), 1);
    assert!(history.total_connected() >= Duration::from_secs(30));
    let record = history.recent().next().unwrap();
    assert_eq!(record.device_id, "mat-1");
    assert_eq!(record.reason, EndReason::UserDisconnect);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_the_link() {
    let (manager, sim) = start(SessionConfig::default());
    connected(&manager, &sim, "mat-1").await;

    manager.shutdown().await.unwrap();
    assert_eq!(manager.get_state().connection, ConnectionPhase::Idle);
    assert_eq!(sim.disconnect_calls(), vec!["mat-1".to_string()]);
    assert_eq!(
        manager.connect(None).await,
        Err(CommandError::Shutdown)
    );
}

#[tokio::test(start_paused = true)]
async fn reconnecting_by_id_after_a_user_disconnect_needs_a_fresh_scan() {
    let (manager, sim) = start(SessionConfig::default());
    connected(&manager, &sim, "mat-1").await;
    manager.disconnect().await.unwrap();
    sim.link_lost("mat-1");
    let state = wait_for_phase(&manager, ConnectionPhase::Idle).await;
    assert!(state.devices.is_empty());

    assert_eq!(
        manager.connect(Some("mat-1".to_string())).await,
        Err(CommandError::Connect(ConnectError::UnknownDevice(
            "mat-1".to_string()
        )))
    );
    assert_eq!(manager.get_state().connection, ConnectionPhase::Idle);
    assert_eq!(sim.connect_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn platform_events_already_delivered_are_handled_before_the_next_command() {
    let (manager, sim) = start(SessionConfig::default());
    manager.check_readiness().await.unwrap();

    sim.change_adapter_state(AdapterState::PoweredOff);
    assert_eq!(
        manager.start_scan(None, None).await,
        Err(CommandError::Scan(ScanError::NotReady(GateError::AdapterOff)))
    );
    assert_eq!(manager.get_state().adapter, AdapterState::PoweredOff);
    assert!(
        !sim.calls()
            .iter()
            .any(|call| matches!(call, PlatformCall::StartScan(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_releases_the_link_and_the_radio() {
    let (manager, sim) = start(SessionConfig::default());
    connected(&manager, &sim, "mat-1").await;
    let watcher = manager.watch_state();

    drop(manager);
    settle().await;

    assert!(sim.is_released());
    assert_eq!(sim.disconnect_calls(), vec!["mat-1".to_string()]);
    assert_eq!(watcher.borrow().connection, ConnectionPhase::Idle);
}

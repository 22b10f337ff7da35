//! Platform binding on top of bluest
//! Scanning and link supervision run as background tasks that report through
//! the platform event channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluest::{Adapter, AdapterEvent, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::error::PlatformError;
use crate::core::bluetooth::platform::{
    event_channel, BlePlatform, PlatformEvent, PlatformEventSender, PlatformEvents,
};
use crate::core::bluetooth::types::{AdapterState, DeviceId, PermissionState};

type DeviceTable = Arc<Mutex<HashMap<DeviceId, Device>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ScanTask {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BluestPlatform {
    adapter: Adapter,
    /// Peripherals seen during scanning, by id
    devices: DeviceTable,
    events: PlatformEventSender,
    scan_task: Mutex<Option<ScanTask>>,
    /// Link supervisors, by peripheral id
    links: Mutex<HashMap<DeviceId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl BluestPlatform {
    /// Opens the default adapter and starts watching its availability.
    pub async fn new() -> Result<(Self, PlatformEvents)> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        let (events, receiver) = event_channel();
        let platform = Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            events,
            scan_task: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        };
        platform.watch_adapter();
        info!("Bluetooth adapter opened.");
        Ok((platform, receiver))
    }

    fn watch_adapter(&self) {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let cancel_token = self.shutdown.clone();

        tokio::spawn(async move {
            let mut stream = match adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Adapter events unavailable: {}", e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    event = stream.next() => {
                        let state = match event {
                            Some(Ok(AdapterEvent::Available)) => AdapterState::PoweredOn,
                            Some(Ok(AdapterEvent::Unavailable)) => AdapterState::PoweredOff,
                            Some(Err(e)) => {
                                warn!("Adapter event error: {}", e);
                                continue;
                            }
                            None => break,
                        };
                        if events.send(PlatformEvent::AdapterStateChanged(state)).is_err() {
                            break;
                        }
                    }
                    _ = cancel_token.cancelled() => break,
                }
            }
            debug!("Adapter watcher stopped");
        });
    }

    async fn internal_scan_task(
        adapter: Adapter,
        services: Vec<Uuid>,
        devices: DeviceTable,
        events: PlatformEventSender,
        cancel_token: CancellationToken,
    ) {
        info!("Starting bluetooth scan");
        let mut scan_stream = match adapter.scan(&services).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start bluetooth scan: {}", e);
                let _ = events.send(PlatformEvent::ScanStopped);
                return;
            }
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(discovered) = result else {
                        info!("Bluetooth scan stream has ended.");
                        let _ = events.send(PlatformEvent::ScanStopped);
                        break;
                    };
                    let Some(rssi) = discovered.rssi else {
                        continue;
                    };
                    let device = discovered.device;
                    let id = device.id().to_string();
                    let name = discovered
                        .adv_data
                        .local_name
                        .clone()
                        .or_else(|| device.name().ok());
                    lock(&devices).insert(id.clone(), device);
                    let _ = events.send(PlatformEvent::DeviceDiscovered { id, name, rssi });
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    /// Connects and then reports the link going down, until cancelled.
    async fn supervise_link(
        adapter: Adapter,
        device: Device,
        id: DeviceId,
        events: PlatformEventSender,
        cancel_token: CancellationToken,
    ) {
        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            tokio::select! {
                result = adapter.connect_device(&device) => {
                    if let Err(e) = result {
                        warn!("Connection to {} failed: {}", id, e);
                        let _ = events.send(PlatformEvent::ConnectFailed {
                            id,
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
                _ = cancel_token.cancelled() => return,
            }
        }
        let _ = events.send(PlatformEvent::PeripheralConnected { id: id.clone() });

        let mut link = match adapter.device_connection_events(&device).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot follow link state of {}: {}", id, e);
                return;
            }
        };
        loop {
            tokio::select! {
                event = link.next() => match event {
                    Some(ConnectionEvent::Connected) => debug!("{} reports connected", id),
                    Some(ConnectionEvent::Disconnected) | None => {
                        let _ = events.send(PlatformEvent::PeripheralDisconnected {
                            id,
                            reason: Some("link lost".to_string()),
                        });
                        break;
                    }
                },
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    fn device(&self, id: &DeviceId) -> Result<Device, PlatformError> {
        lock(&self.devices)
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::Other(format!("Device not found with ID: {}", id)))
    }
}

impl Drop for BluestPlatform {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = lock(&self.scan_task).take() {
            task.cancel_token.cancel();
        }
        for (_, token) in lock(&self.links).drain() {
            token.cancel();
        }
    }
}

#[async_trait]
impl BlePlatform for BluestPlatform {
    async fn adapter_state(&self) -> AdapterState {
        match self.adapter.is_available().await {
            Ok(true) => AdapterState::PoweredOn,
            Ok(false) => AdapterState::PoweredOff,
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                AdapterState::Unknown
            }
        }
    }

    // Desktop stacks prompt on first use themselves; there is no runtime grant.
    async fn permission_state(&self) -> PermissionState {
        PermissionState::Granted
    }

    async fn request_permission(&self) -> PermissionState {
        PermissionState::Granted
    }

    async fn enable_radio(&self) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported(
            "the radio has to be switched on in system settings".to_string(),
        ))
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), PlatformError> {
        self.stop_scan().await?;

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            services.to_vec(),
            self.devices.clone(),
            self.events.clone(),
            cancel_token.clone(),
        ));
        *lock(&self.scan_task) = Some(ScanTask {
            cancel_token,
            handle,
        });
        info!("Device scan task started.");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), PlatformError> {
        let Some(task) = lock(&self.scan_task).take() else {
            return Ok(());
        };
        info!("Stopping Bluetooth scan.");
        task.cancel_token.cancel();
        if let Err(e) = task.handle.await {
            if !e.is_cancelled() {
                error!("Scan task finished with an unexpected join error: {:?}", e);
            }
        }
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), PlatformError> {
        let device = self.device(id)?;
        let cancel_token = CancellationToken::new();
        if let Some(previous) = lock(&self.links).insert(id.clone(), cancel_token.clone()) {
            previous.cancel();
        }
        tokio::spawn(Self::supervise_link(
            self.adapter.clone(),
            device,
            id.clone(),
            self.events.clone(),
            cancel_token,
        ));
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<(), PlatformError> {
        if let Some(token) = lock(&self.links).remove(id) {
            token.cancel();
        }
        let device = self.device(id)?;
        if device.is_connected().await {
            info!("Disconnecting from device {}", id);
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(|e| PlatformError::Other(e.to_string()))?;
        }
        let _ = self.events.send(PlatformEvent::PeripheralDisconnected {
            id: id.clone(),
            reason: None,
        });
        Ok(())
    }
}

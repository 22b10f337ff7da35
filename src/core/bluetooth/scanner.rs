//! Scan orchestration
//! Keeps the table of discovered devices for the current scan cycle and decides
//! which advertisements are worth showing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, info};
use regex::Regex;
use uuid::Uuid;

use crate::core::bluetooth::types::{DeviceId, DiscoveredDevice};

pub struct ScanOrchestrator {
    devices: HashMap<DeviceId, DiscoveredDevice>,
    name_filter: Option<Regex>,
    min_rssi: i16,
    active: bool,
    /// Set when the table changed since the last published batch
    dirty: bool,
    /// Pick the strongest candidate as soon as one shows up
    auto_select: bool,
}

impl ScanOrchestrator {
    pub fn new(name_filter: Option<Regex>, min_rssi: i16) -> Self {
        Self {
            devices: HashMap::new(),
            name_filter,
            min_rssi,
            active: false,
            dirty: false,
            auto_select: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn auto_select(&self) -> bool {
        self.auto_select
    }

    pub fn set_auto_select(&mut self, enabled: bool) {
        self.auto_select = enabled;
    }

    /// Starts a new scan cycle. Results of the previous cycle are dropped.
    pub fn begin(&mut self, services: &[Uuid], auto_select: bool) {
        info!("Starting scan cycle (filter: {:?})", services);
        self.devices.clear();
        self.active = true;
        self.dirty = false;
        self.auto_select = auto_select;
    }

    /// Ends the current cycle, keeping its results.
    pub fn end(&mut self) {
        if self.active {
            info!("Scan cycle ended with {} device(s)", self.devices.len());
        }
        self.active = false;
        self.auto_select = false;
    }

    /// Forgets every discovered device.
    pub fn clear(&mut self) {
        self.devices.clear();
        self.dirty = false;
    }

    /// Inserts or refreshes a device. Returns false when the advertisement is
    /// filtered out or no scan is running.
    pub fn upsert(
        &mut self,
        id: DeviceId,
        name: Option<String>,
        rssi: i16,
        seen_at: DateTime<Utc>,
    ) -> bool {
        if !self.active {
            return false;
        }
        if rssi < self.min_rssi {
            debug!("Ignoring {} (RSSI {} below {})", id, rssi, self.min_rssi);
            return false;
        }

        match self.devices.get_mut(&id) {
            Some(device) => {
                device.signal_strength = rssi;
                device.last_seen_at = seen_at;
                // Some stacks only include the name in the scan response.
                if name.is_some() {
                    device.display_name = name;
                }
            }
            None => {
                if !self.matches_name(name.as_deref()) {
                    debug!("Ignoring {} ({:?}): name does not match", id, name);
                    return false;
                }
                debug!("Found device {} ({:?}), RSSI {}", id, name, rssi);
                self.devices
                    .insert(id.clone(), DiscoveredDevice::new(id, name, rssi, seen_at));
            }
        }
        self.dirty = true;
        true
    }

    fn matches_name(&self, name: Option<&str>) -> bool {
        match (&self.name_filter, name) {
            (None, _) => true,
            (Some(pattern), Some(name)) => pattern.is_match(name),
            (Some(_), None) => false,
        }
    }

    /// Clears and returns the "changed since last batch" flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices ordered by descending signal strength, ties by id.
    pub fn sorted(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<DiscoveredDevice> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| {
            b.signal_strength
                .cmp(&a.signal_strength)
                .then_with(|| a.id.cmp(&b.id))
        });
        devices
    }

    pub fn strongest(&self) -> Option<DeviceId> {
        self.sorted().into_iter().next().map(|device| device.id)
    }
}

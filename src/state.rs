// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application state management.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::bluetooth::{BleError, ConnectionState, Counter, LedCommand, Peripheral};

/// Tray icon for a connection state.
pub fn icon_name(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "bluetooth-disabled",
        ConnectionState::Connecting | ConnectionState::Disconnecting => "bluetooth-paired",
        ConnectionState::Connected => "bluetooth-active",
        ConnectionState::Failed => "dialog-error",
    }
}

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Current connection status.
    pub connection_status: RwLock<ConnectionState>,

    /// Connected device.
    pub connected_device: RwLock<Option<Peripheral>>,

    /// Peripherals from the latest scan, in order of first sighting.
    pub discovered: RwLock<Vec<Peripheral>>,

    pub scanning: RwLock<bool>,

    /// Last LED command acknowledged by the device.
    pub led: RwLock<Option<LedCommand>>,

    /// Latest known click counts.
    pub counters: RwLock<HashMap<Counter, u32>>,

    /// Last error, shown in the tooltip.
    pub last_error: RwLock<Option<BleError>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            connection_status: RwLock::new(ConnectionState::Disconnected),
            connected_device: RwLock::new(None),
            discovered: RwLock::new(Vec::new()),
            scanning: RwLock::new(false),
            led: RwLock::new(None),
            counters: RwLock::new(HashMap::new()),
            last_error: RwLock::new(None),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get_status(&self) -> ConnectionState {
        *self.connection_status.read()
    }

    /// Apply a connection change. Device details are dropped once the link is gone.
    pub fn set_connection(&self, state: ConnectionState, peripheral: Option<Peripheral>) {
        *self.connection_status.write() = state;
        match state {
            ConnectionState::Connected => {
                *self.connected_device.write() = peripheral;
                *self.last_error.write() = None;
            }
            ConnectionState::Disconnected => {
                *self.connected_device.write() = None;
                *self.led.write() = None;
                self.counters.write().clear();
            }
            _ => {}
        }
    }

    pub fn get_device_name(&self) -> Option<String> {
        self.connected_device
            .read()
            .as_ref()
            .map(|p| p.display_name().to_string())
    }

    /// Clear the list for a new scan.
    /// Clear the list for a new scan. Returns the previous list so a scan
    /// that fails to start can put it back.
    pub fn begin_scan(&self) -> Vec<Peripheral> {
        *self.scanning.write() = true;
        std::mem::take(&mut *self.discovered.write())
    }

    /// Undo `begin_scan` after the scan failed to start.
    pub fn abort_scan(&self, previous: Vec<Peripheral>) {
        *self.discovered.write() = previous;
        *self.scanning.write() = false;
    }

    pub fn end_scan(&self) {
        *self.scanning.write() = false;
    }

    pub fn is_scanning(&self) -> bool {
        *self.scanning.read()
    }

    /// Add a sighting, or refresh the entry it repeats.
    pub fn add_discovered(&self, sighting: Peripheral) {
        let mut discovered = self.discovered.write();
        match discovered.iter_mut().find(|p| p.id == sighting.id) {
            Some(known) => known.refresh(sighting),
            None => discovered.push(sighting),
        }
    }

    pub fn get_discovered(&self) -> Vec<Peripheral> {
        self.discovered.read().clone()
    }

    pub fn find_discovered(&self, id: &str) -> Option<Peripheral> {
        self.discovered.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn scan_status_text(&self) -> &'static str {
        if self.is_scanning() {
            "Scanning..."
        } else {
            "Waiting to scan..."
        }
    }

    pub fn set_led(&self, command: LedCommand) {
        *self.led.write() = Some(command);
    }

    pub fn get_led(&self) -> Option<LedCommand> {
        *self.led.read()
    }

    pub fn set_counter(&self, counter: Counter, value: u32) {
        self.counters.write().insert(counter, value);
    }

    pub fn get_counter(&self, counter: Counter) -> Option<u32> {
        self.counters.read().get(&counter).copied()
    }

    pub fn set_error(&self, error: BleError) {
        *self.last_error.write() = Some(error);
    }

    pub fn get_last_error(&self) -> Option<BleError> {
        self.last_error.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovered_refresh_keeps_order() {
        let state = AppState::new();
        state.begin_scan();
        state.add_discovered(Peripheral::new("A").with_name("First"));
        state.add_discovered(Peripheral::new("B").with_name("Second"));
        state.add_discovered(Peripheral::new("A").with_rssi(-40));

        let discovered = state.get_discovered();
        assert_eq!(discovered.len(), 2);
        assert_eq!(discovered[0].id, "A");
        assert_eq!(discovered[0].name.as_deref(), Some("First"));
        assert_eq!(discovered[0].rssi, Some(-40));
    }

    #[test]
    fn test_failed_scan_start_keeps_list() {
        let state = AppState::new();
        state.add_discovered(Peripheral::new("A").with_name("First"));

        let previous = state.begin_scan();
        assert!(state.get_discovered().is_empty());
        assert!(state.is_scanning());

        state.abort_scan(previous);
        assert!(!state.is_scanning());
        assert_eq!(state.get_discovered().len(), 1);
        assert!(state.find_discovered("A").is_some());
    }

    #[test]
    fn test_scan_status_text() {
        let state = AppState::new();
        assert_eq!(state.scan_status_text(), "Waiting to scan...");
        state.begin_scan();
        assert_eq!(state.scan_status_text(), "Scanning...");
        state.end_scan();
        assert_eq!(state.scan_status_text(), "Waiting to scan...");
    }

    #[test]
    fn test_disconnect_clears_device_data() {
        let state = AppState::new();
        state.set_connection(
            ConnectionState::Connected,
            Some(Peripheral::new("A").with_name("P2PSRV1")),
        );
        state.set_led(LedCommand::Led1);
        state.set_counter(Counter::MainButton, 3);
        assert_eq!(state.get_device_name().as_deref(), Some("P2PSRV1"));

        state.set_connection(ConnectionState::Disconnected, None);
        assert_eq!(state.get_device_name(), None);
        assert_eq!(state.get_led(), None);
        assert_eq!(state.get_counter(Counter::MainButton), None);
    }
}

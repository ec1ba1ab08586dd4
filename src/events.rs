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

//! Event processing: folds device events into the application state.

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bluetooth::{
    decode_counter, BleError, ConnectionState, DeviceEvent, GattProfile, LedCommand, ScanEndReason,
};
use crate::state::AppState;

/// Process events from the Bluetooth manager.
pub struct EventProcessor {
    state: Arc<AppState>,
    profile: GattProfile,
}

impl EventProcessor {
    pub fn new(state: Arc<AppState>, profile: GattProfile) -> Self {
        Self { state, profile }
    }

    /// Process a single event.
    pub fn process_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::PeripheralDiscovered(peripheral) => {
                debug!(
                    "Discovered {} ({}) rssi={:?}",
                    peripheral.display_name(),
                    peripheral.id,
                    peripheral.rssi
                );
                self.state.add_discovered(peripheral);
            }
            DeviceEvent::ScanEnded { reason, discovered } => {
                match reason {
                    ScanEndReason::Failed => warn!("Scan failed after {} devices", discovered),
                    _ => info!("Scan {:?}, {} devices found", reason, discovered),
                }
                self.state.end_scan();
            }
            DeviceEvent::ConnectionStateChanged { state, peripheral } => {
                info!("Connection state: {}", state.as_str());
                self.state.set_connection(state, peripheral);
            }
            DeviceEvent::CharacteristicUpdated { uuid, value } => {
                self.handle_value(uuid, &value);
            }
            DeviceEvent::ErrorOccurred(e) => {
                self.handle_error(e);
            }
        }
    }

    fn handle_value(&self, uuid: Uuid, value: &[u8]) {
        if let Some(counter) = self.profile.counter_for(uuid) {
            match decode_counter(value) {
                Some(count) => {
                    info!("{} clicks: {}", counter.label(), count);
                    self.state.set_counter(counter, count);
                }
                None => warn!("Ignoring malformed {} value {:?}", counter.label(), value),
            }
        } else if uuid == self.profile.led {
            if let Some(command) = value.first().copied().and_then(LedCommand::from_byte) {
                self.state.set_led(command);
            }
        } else {
            debug!("Value of {} changed: {:?}", uuid, value);
        }
    }

    fn handle_error(&self, e: BleError) {
        if e.is_link_error() {
            warn!("Link error: {}", e);
        } else {
            error!("Bluetooth error: {}", e);
        }
        self.state.set_error(e);
    }
}

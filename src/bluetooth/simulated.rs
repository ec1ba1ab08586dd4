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

//! In-process radio stack.
//!
//! Behaves like a cooperative platform stack: connect requests are answered
//! with link callbacks, reads return stored values and writes are recorded.
//! Tests drive advertisements, notifications and link drops by hand.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::error::BleError;
use super::peripheral::{Characteristic, Peripheral};
use super::radio::{RadioEvent, RadioStack};

/// How the simulated stack answers a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Report the link as established.
    Accept,
    /// Report the link as failed with this reason.
    Reject(String),
    /// Never answer.
    Ignore,
}

struct SimState {
    available: bool,
    enabled: bool,
    permitted: bool,
    stalled: bool,
    scan_start_delay: Duration,
    scanning: bool,
    connect_outcome: ConnectOutcome,
    peripherals: HashMap<String, Vec<Characteristic>>,
    values: HashMap<(String, Uuid), Vec<u8>>,
    connected: HashSet<String>,
    subscribed: HashSet<(String, Uuid)>,
    writes: Vec<(String, Uuid, Vec<u8>)>,
}

/// Radio stack living entirely in memory.
pub struct SimulatedRadio {
    events: mpsc::Sender<RadioEvent>,
    state: Mutex<SimState>,
}

impl SimulatedRadio {
    /// Create the radio and the callback channel it reports on.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<RadioEvent>) {
        let (events, rx) = mpsc::channel(64);
        let radio = Arc::new(Self {
            events,
            state: Mutex::new(SimState {
                available: true,
                enabled: true,
                permitted: true,
                stalled: false,
                scan_start_delay: Duration::ZERO,
                scanning: false,
                connect_outcome: ConnectOutcome::Accept,
                peripherals: HashMap::new(),
                values: HashMap::new(),
                connected: HashSet::new(),
                subscribed: HashSet::new(),
                writes: Vec::new(),
            }),
        });
        (radio, rx)
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn set_permitted(&self, permitted: bool) {
        self.state.lock().permitted = permitted;
    }

    /// Make reads, writes and subscribes hang.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Make `start_scan` take this long before the radio is scanning.
    pub fn set_scan_start_delay(&self, delay: Duration) {
        self.state.lock().scan_start_delay = delay;
    }

    pub fn set_connect_outcome(&self, outcome: ConnectOutcome) {
        self.state.lock().connect_outcome = outcome;
    }

    /// Register a device that can be connected to.
    pub fn add_peripheral(&self, peripheral: Peripheral, characteristics: Vec<Characteristic>) {
        self.state
            .lock()
            .peripherals
            .insert(peripheral.id, characteristics);
    }

    pub fn set_value(&self, peripheral_id: &str, uuid: Uuid, value: Vec<u8>) {
        self.state
            .lock()
            .values
            .insert((peripheral_id.to_string(), uuid), value);
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    pub fn is_connected(&self, peripheral_id: &str) -> bool {
        self.state.lock().connected.contains(peripheral_id)
    }

    pub fn is_subscribed(&self, peripheral_id: &str, uuid: Uuid) -> bool {
        self.state
            .lock()
            .subscribed
            .contains(&(peripheral_id.to_string(), uuid))
    }

    /// Every write received, in order.
    pub fn writes(&self) -> Vec<(String, Uuid, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    async fn emit(&self, event: RadioEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Simulated radio has no listener");
        }
    }

    /// Report an advertisement.
    pub async fn advertise(&self, peripheral: Peripheral) {
        self.emit(RadioEvent::Discovered(peripheral)).await;
    }

    /// Report a scan failure.
    pub async fn fail_scan(&self, code: i32) {
        self.state.lock().scanning = false;
        self.emit(RadioEvent::ScanFailed(code)).await;
    }

    /// Report a notification on a subscribed characteristic.
    pub async fn notify(&self, peripheral_id: &str, uuid: Uuid, value: Vec<u8>) {
        self.set_value(peripheral_id, uuid, value.clone());
        self.emit(RadioEvent::Notification {
            peripheral_id: peripheral_id.to_string(),
            characteristic: uuid,
            value,
        })
        .await;
    }

    /// Drop a link without being asked to.
    pub async fn drop_link(&self, peripheral_id: &str) {
        {
            let mut state = self.state.lock();
            state.connected.remove(peripheral_id);
            state.subscribed.retain(|(id, _)| id != peripheral_id);
        }
        self.emit(RadioEvent::LinkClosed {
            peripheral_id: peripheral_id.to_string(),
        })
        .await;
    }

    async fn stall_if_requested(&self) {
        let stalled = self.state.lock().stalled;
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl RadioStack for SimulatedRadio {
    fn backend_name(&self) -> &'static str {
        "Simulated"
    }

    async fn is_available(&self) -> bool {
        self.state.lock().available
    }

    async fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    async fn check_permissions(&self) -> Result<(), BleError> {
        if self.state.lock().permitted {
            Ok(())
        } else {
            Err(BleError::PermissionDenied)
        }
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        let delay = self.state.lock().scan_start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.state.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<(), BleError> {
        let (outcome, characteristics) = {
            let state = self.state.lock();
            (
                state.connect_outcome.clone(),
                state.peripherals.get(peripheral_id).cloned(),
            )
        };

        let event = match (outcome, characteristics) {
            (ConnectOutcome::Ignore, _) => return Ok(()),
            (ConnectOutcome::Reject(reason), _) => RadioEvent::LinkFailed {
                peripheral_id: peripheral_id.to_string(),
                reason,
            },
            (ConnectOutcome::Accept, None) => RadioEvent::LinkFailed {
                peripheral_id: peripheral_id.to_string(),
                reason: "device not found".to_string(),
            },
            (ConnectOutcome::Accept, Some(characteristics)) => {
                self.state.lock().connected.insert(peripheral_id.to_string());
                RadioEvent::LinkEstablished {
                    peripheral_id: peripheral_id.to_string(),
                    characteristics,
                }
            }
        };
        self.emit(event).await;
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<(), BleError> {
        let was_connected = {
            let mut state = self.state.lock();
            state.subscribed.retain(|(id, _)| id != peripheral_id);
            state.connected.remove(peripheral_id)
        };
        if was_connected {
            self.emit(RadioEvent::LinkClosed {
                peripheral_id: peripheral_id.to_string(),
            })
            .await;
        }
        Ok(())
    }

    async fn read(&self, peripheral_id: &str, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        self.stall_if_requested().await;
        let state = self.state.lock();
        Ok(state
            .values
            .get(&(peripheral_id.to_string(), characteristic))
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        peripheral_id: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        self.stall_if_requested().await;
        let mut state = self.state.lock();
        state
            .writes
            .push((peripheral_id.to_string(), characteristic, value.to_vec()));
        state
            .values
            .insert((peripheral_id.to_string(), characteristic), value.to_vec());
        Ok(())
    }

    async fn subscribe(&self, peripheral_id: &str, characteristic: Uuid) -> Result<(), BleError> {
        self.stall_if_requested().await;
        self.state
            .lock()
            .subscribed
            .insert((peripheral_id.to_string(), characteristic));
        Ok(())
    }
}

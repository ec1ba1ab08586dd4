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

//! Device manager tying scanner, connection and event bus to one radio.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::ble_constants::timing;
use super::channel::{CharacteristicChannel, Subscription};
use super::connection::{ConnectionManager, ConnectionState};
use super::device::{decode_counter, Counter, GattProfile, LedCommand};
use super::error::BleError;
use super::event_bus::{EventBus, EventReceiver, DEFAULT_EVENT_CAPACITY};
use super::peripheral::Peripheral;
use super::radio::{RadioEvent, RadioGateway, RadioStack};
use super::scanner::{Scanner, ScannerOptions};

/// Settings for [`BluetoothManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub scan_duration: Duration,
    pub operation_timeout: Duration,
    pub named_only: bool,
    pub event_capacity: usize,
    pub profile: GattProfile,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(timing::DEFAULT_SCAN_SECS),
            operation_timeout: Duration::from_millis(timing::DEFAULT_OPERATION_TIMEOUT_MS),
            named_only: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            profile: GattProfile::default(),
        }
    }
}

/// BLE central: discovers peripherals, holds one link, talks to its characteristics.
///
/// Radio callbacks are drained by a single background task, so scanner and
/// connection updates never interleave. Results reach the caller through
/// [`BluetoothManager::subscribe`].
pub struct BluetoothManager {
    gateway: RadioGateway,
    bus: Arc<EventBus>,
    scanner: Scanner,
    connection: Arc<ConnectionManager>,
    options: ManagerOptions,
    dispatcher: JoinHandle<()>,
}

impl BluetoothManager {
    /// Create the manager and start draining `radio_events`.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        radio: Arc<dyn RadioStack>,
        radio_events: mpsc::Receiver<RadioEvent>,
        options: ManagerOptions,
    ) -> Self {
        info!("Bluetooth manager using {} radio", radio.backend_name());

        let bus = Arc::new(EventBus::new(options.event_capacity));
        let scanner = Scanner::new(
            radio.clone(),
            bus.clone(),
            ScannerOptions {
                operation_timeout: options.operation_timeout,
                named_only: options.named_only,
            },
        );
        let connection = Arc::new(ConnectionManager::new(
            radio.clone(),
            bus.clone(),
            options.operation_timeout,
        ));

        let dispatcher = tokio::spawn(Self::dispatch_loop(
            radio_events,
            scanner.clone(),
            connection.clone(),
        ));

        Self {
            gateway: RadioGateway::new(radio),
            bus,
            scanner,
            connection,
            options,
            dispatcher,
        }
    }

    /// Apply radio callbacks in arrival order.
    async fn dispatch_loop(
        mut radio_events: mpsc::Receiver<RadioEvent>,
        scanner: Scanner,
        connection: Arc<ConnectionManager>,
    ) {
        debug!("Radio event dispatcher started");
        while let Some(event) = radio_events.recv().await {
            match event {
                RadioEvent::Discovered(peripheral) => scanner.on_discovered(peripheral),
                RadioEvent::ScanFailed(code) => scanner.on_scan_failed(code),
                RadioEvent::LinkEstablished {
                    peripheral_id,
                    characteristics,
                } => connection.on_link_established(&peripheral_id, characteristics),
                RadioEvent::LinkFailed {
                    peripheral_id,
                    reason,
                } => connection.on_link_failed(&peripheral_id, &reason),
                RadioEvent::LinkClosed { peripheral_id } => {
                    connection.on_link_closed(&peripheral_id)
                }
                RadioEvent::Notification {
                    peripheral_id,
                    characteristic,
                    value,
                } => connection.on_notification(&peripheral_id, characteristic, value),
            }
        }
        info!("Radio event channel closed");
    }

    /// Attach the event subscriber, replacing any previous one.
    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn gateway(&self) -> &RadioGateway {
        &self.gateway
    }

    /// Scan for the configured duration.
    pub async fn start_scan(&self) -> Result<(), BleError> {
        self.scanner.start(self.options.scan_duration).await
    }

    pub async fn start_scan_for(&self, duration: Duration) -> Result<(), BleError> {
        self.scanner.start(duration).await
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanner.stop().await
    }

    /// Start or stop scanning. Returns whether a scan is now running.
    pub async fn toggle_scan(&self) -> Result<bool, BleError> {
        self.scanner.toggle(self.options.scan_duration).await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Peripherals of the active scan session.
    pub fn discovered(&self) -> Vec<Peripheral> {
        self.scanner.peripherals()
    }

    pub async fn connect(&self, peripheral: Peripheral) -> Result<(), BleError> {
        self.connection.connect(peripheral).await
    }

    /// Connect by address, using what the scan knows about it.
    pub async fn connect_to(&self, peripheral_id: &str) -> Result<(), BleError> {
        let peripheral = self
            .scanner
            .peripheral(peripheral_id)
            .unwrap_or_else(|| Peripheral::new(peripheral_id));
        self.connect(peripheral).await
    }

    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.connection.disconnect().await
    }

    /// Clear a failed connection attempt.
    pub fn acknowledge_failure(&self) {
        self.connection.acknowledge();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connected_peripheral(&self) -> Option<Peripheral> {
        match self.connection.state() {
            ConnectionState::Connected => self.connection.peripheral(),
            _ => None,
        }
    }

    /// Characteristic access; `NotConnected` unless a link is up.
    pub fn channel(&self) -> Result<Arc<CharacteristicChannel>, BleError> {
        self.connection.channel()
    }

    pub async fn write(&self, uuid: Uuid, value: &[u8]) -> Result<(), BleError> {
        self.channel()?.write(uuid, value).await
    }

    pub async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, BleError> {
        self.channel()?.read(uuid).await
    }

    pub async fn subscribe_to(&self, uuid: Uuid) -> Result<Subscription, BleError> {
        self.channel()?.subscribe(uuid).await
    }

    pub async fn set_led(&self, command: LedCommand) -> Result<(), BleError> {
        info!("LED command {:?}", command);
        self.write(self.options.profile.led, &command.as_bytes())
            .await
    }

    pub async fn read_counter(&self, counter: Counter) -> Result<u32, BleError> {
        let payload = self.read(self.options.profile.counter(counter)).await?;
        decode_counter(&payload).ok_or_else(|| {
            BleError::Platform(format!(
                "malformed {} counter payload ({} bytes)",
                counter.label(),
                payload.len()
            ))
        })
    }

    /// Counter notifications; ends when the link drops.
    pub async fn watch_counter(&self, counter: Counter) -> Result<Subscription, BleError> {
        self.subscribe_to(self.options.profile.counter(counter))
            .await
    }
}

impl Drop for BluetoothManager {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::event_bus::DeviceEvent;
    use crate::bluetooth::peripheral::{Characteristic, CharacteristicFlags};
    use crate::bluetooth::simulated::SimulatedRadio;
    use futures::StreamExt;

    fn smart_device(radio: &SimulatedRadio, id: &str) -> Peripheral {
        let profile = GattProfile::default();
        radio.add_peripheral(
            Peripheral::new(id),
            vec![
                Characteristic::new(profile.led, CharacteristicFlags::READ_WRITE),
                Characteristic::new(profile.main_button, CharacteristicFlags::READ_NOTIFY),
                Characteristic::new(profile.third_button, CharacteristicFlags::READ_NOTIFY),
            ],
        );
        Peripheral::new(id).with_name("P2PSRV1")
    }

    fn manager() -> (BluetoothManager, Arc<SimulatedRadio>) {
        let (radio, events) = SimulatedRadio::new();
        let manager = BluetoothManager::new(radio.clone(), events, ManagerOptions::default());
        (manager, radio)
    }

    #[tokio::test]
    async fn test_led_and_counters() {
        let (manager, radio) = manager();
        let p = smart_device(&radio, "AA:BB");
        let profile = GattProfile::default();
        radio.set_value("AA:BB", profile.third_button, vec![4]);

        manager.connect(p).await.unwrap();
        manager.set_led(LedCommand::Led1).await.unwrap();
        assert_eq!(
            radio.writes(),
            vec![("AA:BB".to_string(), profile.led, vec![0x01])]
        );
        assert_eq!(manager.read_counter(Counter::ThirdButton).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_malformed_counter() {
        let (manager, radio) = manager();
        let p = smart_device(&radio, "AA:BB");
        manager.connect(p).await.unwrap();

        let result = manager.read_counter(Counter::MainButton).await;
        assert!(matches!(result, Err(BleError::Platform(_))));
    }

    #[tokio::test]
    async fn test_write_while_disconnected() {
        let (manager, _radio) = manager();
        assert_eq!(
            manager.set_led(LedCommand::Led1).await,
            Err(BleError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_notifications_reach_bus_and_stream() {
        let (manager, radio) = manager();
        let p = smart_device(&radio, "AA:BB");
        let rx = manager.subscribe();
        manager.connect(p).await.unwrap();
        let mut clicks = manager.watch_counter(Counter::MainButton).await.unwrap();
        let uuid = GattProfile::default().main_button;

        radio.notify("AA:BB", uuid, vec![1]).await;
        assert_eq!(clicks.next().await, Some(vec![1]));

        let updated = loop {
            match rx.recv().await.unwrap() {
                DeviceEvent::CharacteristicUpdated { uuid, value } => break (uuid, value),
                _ => continue,
            }
        };
        assert_eq!(updated, (uuid, vec![1]));
    }

    #[tokio::test]
    async fn test_connect_to_uses_scan_details() {
        let (manager, radio) = manager();
        smart_device(&radio, "AA:BB");
        manager.start_scan_for(Duration::from_secs(10)).await.unwrap();
        radio
            .advertise(Peripheral::new("AA:BB").with_name("P2PSRV1"))
            .await;
        while manager.discovered().is_empty() {
            tokio::task::yield_now().await;
        }

        manager.connect_to("AA:BB").await.unwrap();
        assert_eq!(
            manager.connected_peripheral().and_then(|p| p.name),
            Some("P2PSRV1".to_string())
        );
    }
}

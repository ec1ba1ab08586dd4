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

//! Connection state machine for the single peripheral link.
//!
//! ```text
//! Disconnected --connect--> Connecting --established--> Connected
//! Connected --disconnect--> Disconnecting --closed--> Disconnected
//! Connecting --failed--> Failed --acknowledge--> Disconnected
//! Connected --dropped by the radio--> Disconnected (LinkLost)
//! ```
//!
//! Every transition happens under one lock and is published on the event bus.
//! Nothing here reconnects by itself.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::CharacteristicChannel;
use super::error::BleError;
use super::event_bus::{DeviceEvent, EventBus};
use super::peripheral::{Characteristic, Peripheral};
use super::radio::{bounded, RadioGateway, RadioStack};

/// State of the connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// The last attempt failed; `acknowledge` returns to Disconnected.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting...",
            ConnectionState::Failed => "Connection failed",
        }
    }
}

type Completion = oneshot::Sender<Result<(), BleError>>;

struct Link {
    state: ConnectionState,
    peripheral: Option<Peripheral>,
    channel: Option<Arc<CharacteristicChannel>>,
    /// Resolves the caller waiting on a connect or disconnect.
    pending: Option<Completion>,
    attempt: u64,
}

impl Link {
    fn matches(&self, peripheral_id: &str) -> bool {
        self.peripheral
            .as_ref()
            .is_some_and(|p| p.id == peripheral_id)
    }

    fn complete(&mut self, result: Result<(), BleError>) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.send(result);
        }
    }

    fn close_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

/// Owns at most one link to a peripheral.
pub struct ConnectionManager {
    radio: Arc<dyn RadioStack>,
    gateway: RadioGateway,
    bus: Arc<EventBus>,
    link: Mutex<Link>,
    operation_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(radio: Arc<dyn RadioStack>, bus: Arc<EventBus>, operation_timeout: Duration) -> Self {
        Self {
            gateway: RadioGateway::new(radio.clone()),
            radio,
            bus,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                peripheral: None,
                channel: None,
                pending: None,
                attempt: 0,
            }),
            operation_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    /// The peripheral of the current (or last failed) link.
    pub fn peripheral(&self) -> Option<Peripheral> {
        self.link.lock().peripheral.clone()
    }

    /// Characteristic access, only while Connected.
    pub fn channel(&self) -> Result<Arc<CharacteristicChannel>, BleError> {
        let link = self.link.lock();
        match (&link.state, &link.channel) {
            (ConnectionState::Connected, Some(channel)) => Ok(channel.clone()),
            _ => Err(BleError::NotConnected),
        }
    }

    fn transition(&self, link: &mut Link, state: ConnectionState) {
        debug!("Connection {:?} -> {:?}", link.state, state);
        link.state = state;
        let peripheral = if state == ConnectionState::Disconnected {
            link.close_channel();
            link.peripheral.take()
        } else {
            link.peripheral.clone()
        };
        self.bus
            .publish(DeviceEvent::ConnectionStateChanged { state, peripheral });
    }

    /// Open a link to `peripheral`.
    ///
    /// Fails with `AlreadyConnected` unless the slot is Disconnected; an
    /// existing link is never replaced implicitly. Dropping the returned
    /// future tears the attempt down.
    pub async fn connect(&self, peripheral: Peripheral) -> Result<(), BleError> {
        self.gateway.ensure_ready().await?;

        let (done_tx, done_rx) = oneshot::channel();
        let attempt = {
            let mut link = self.link.lock();
            if link.state != ConnectionState::Disconnected {
                return Err(BleError::AlreadyConnected);
            }
            link.attempt += 1;
            link.peripheral = Some(peripheral.clone());
            link.pending = Some(done_tx);
            self.transition(&mut link, ConnectionState::Connecting);
            link.attempt
        };

        info!("Connecting to {} ({})", peripheral.display_name(), peripheral.id);
        let mut guard = AttemptGuard {
            manager: self,
            attempt,
            armed: true,
        };

        let outcome = bounded(self.operation_timeout, async {
            self.radio.connect(&peripheral.id).await?;
            done_rx.await.unwrap_or_else(|_| {
                Err(BleError::LinkFailed("connection attempt cancelled".to_string()))
            })
        })
        .await;
        guard.armed = false;

        match outcome {
            Ok(()) => {
                info!("Connected to {}", peripheral.id);
                Ok(())
            }
            Err(BleError::Timeout) => {
                if self.abandon(attempt) {
                    warn!("Connection to {} timed out", peripheral.id);
                    self.bus.publish(DeviceEvent::ErrorOccurred(BleError::Timeout));
                    Err(BleError::Timeout)
                } else if self.state() == ConnectionState::Connected {
                    // The link came up just as the timer fired.
                    Ok(())
                } else {
                    Err(BleError::Timeout)
                }
            }
            Err(e) => {
                self.fail(attempt, e.clone());
                Err(e)
            }
        }
    }

    /// Move a still-connecting `attempt` to Failed.
    fn fail(&self, attempt: u64, reason: BleError) {
        let mut link = self.link.lock();
        if link.attempt != attempt || link.state != ConnectionState::Connecting {
            return;
        }
        error!("Connection failed: {}", reason);
        link.pending = None;
        self.transition(&mut link, ConnectionState::Failed);
        self.bus.publish(DeviceEvent::ErrorOccurred(reason));
    }

    /// Return a still-connecting `attempt` to Disconnected and tear down the
    /// radio request. Returns whether anything was abandoned.
    fn abandon(&self, attempt: u64) -> bool {
        let peripheral_id = {
            let mut link = self.link.lock();
            if link.attempt != attempt || link.state != ConnectionState::Connecting {
                return false;
            }
            let id = link.peripheral.as_ref().map(|p| p.id.clone());
            link.pending = None;
            self.transition(&mut link, ConnectionState::Disconnected);
            id
        };

        if let Some(id) = peripheral_id {
            self.teardown(id);
        }
        true
    }

    /// Best-effort radio disconnect in the background.
    fn teardown(&self, peripheral_id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to tear down link to {}", peripheral_id);
            return;
        };
        let radio = self.radio.clone();
        let limit = self.operation_timeout;
        runtime.spawn(async move {
            if let Err(e) = bounded(limit, radio.disconnect(&peripheral_id)).await {
                debug!("Teardown of {} failed: {}", peripheral_id, e);
            }
        });
    }

    /// Close the link.
    ///
    /// Idle is a no-op, a pending attempt is abandoned and a failed attempt
    /// is acknowledged. From Connected the channel is invalidated at once
    /// and the call waits for the radio to confirm.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        let (done_tx, done_rx) = oneshot::channel();
        let peripheral_id = {
            let mut link = self.link.lock();
            let state = link.state;
            match state {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => return Ok(()),
                ConnectionState::Failed => {
                    self.transition(&mut link, ConnectionState::Disconnected);
                    return Ok(());
                }
                ConnectionState::Connecting => {
                    let attempt = link.attempt;
                    drop(link);
                    self.abandon(attempt);
                    return Ok(());
                }
                ConnectionState::Connected => {
                    link.close_channel();
                    link.pending = Some(done_tx);
                    self.transition(&mut link, ConnectionState::Disconnecting);
                    link.peripheral
                        .as_ref()
                        .map(|p| p.id.clone())
                        .unwrap_or_default()
                }
            }
        };

        info!("Disconnecting from {}", peripheral_id);
        let outcome = bounded(self.operation_timeout, async {
            self.radio.disconnect(&peripheral_id).await?;
            done_rx.await.unwrap_or(Ok(()))
        })
        .await;

        if let Err(e) = outcome {
            warn!("Disconnect from {} did not complete: {}", peripheral_id, e);
            let mut link = self.link.lock();
            if link.state == ConnectionState::Disconnecting {
                link.pending = None;
                self.transition(&mut link, ConnectionState::Disconnected);
            }
            drop(link);
            self.bus.publish(DeviceEvent::ErrorOccurred(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Leave the Failed state.
    pub fn acknowledge(&self) {
        let mut link = self.link.lock();
        if link.state == ConnectionState::Failed {
            self.transition(&mut link, ConnectionState::Disconnected);
        }
    }

    /// Radio callback: the requested link is up.
    pub fn on_link_established(&self, peripheral_id: &str, characteristics: Vec<Characteristic>) {
        let mut link = self.link.lock();
        if link.state != ConnectionState::Connecting || !link.matches(peripheral_id) {
            warn!("Ignoring stale link to {}", peripheral_id);
            drop(link);
            self.teardown(peripheral_id.to_string());
            return;
        }

        let peripheral = link.peripheral.clone().unwrap_or_else(|| Peripheral::new(peripheral_id));
        info!(
            "Link to {} established with {} characteristic(s)",
            peripheral_id,
            characteristics.len()
        );
        link.channel = Some(Arc::new(CharacteristicChannel::new(
            peripheral,
            characteristics,
            self.radio.clone(),
            self.bus.clone(),
            self.operation_timeout,
        )));
        self.transition(&mut link, ConnectionState::Connected);
        link.complete(Ok(()));
    }

    /// Radio callback: the requested link could not be established.
    pub fn on_link_failed(&self, peripheral_id: &str, reason: &str) {
        let mut link = self.link.lock();
        if link.state != ConnectionState::Connecting || !link.matches(peripheral_id) {
            debug!("Ignoring failure of stale link to {}", peripheral_id);
            return;
        }
        let error = BleError::LinkFailed(reason.to_string());
        error!("Link to {} failed: {}", peripheral_id, reason);
        self.transition(&mut link, ConnectionState::Failed);
        link.complete(Err(error.clone()));
        self.bus.publish(DeviceEvent::ErrorOccurred(error));
    }

    /// Radio callback: a link went down.
    pub fn on_link_closed(&self, peripheral_id: &str) {
        let mut link = self.link.lock();
        if !link.matches(peripheral_id) {
            return;
        }
        match link.state {
            ConnectionState::Connected => {
                warn!("Link to {} lost", peripheral_id);
                self.transition(&mut link, ConnectionState::Disconnected);
                self.bus.publish(DeviceEvent::ErrorOccurred(BleError::LinkLost));
            }
            ConnectionState::Disconnecting => {
                info!("Disconnected from {}", peripheral_id);
                self.transition(&mut link, ConnectionState::Disconnected);
                link.complete(Ok(()));
            }
            ConnectionState::Connecting => {
                let error = BleError::LinkFailed("link closed while connecting".to_string());
                self.transition(&mut link, ConnectionState::Failed);
                link.complete(Err(error.clone()));
                self.bus.publish(DeviceEvent::ErrorOccurred(error));
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }
    }

    /// Radio callback: a subscribed characteristic changed.
    pub fn on_notification(&self, peripheral_id: &str, uuid: Uuid, value: Vec<u8>) {
        let channel = {
            let link = self.link.lock();
            if link.state != ConnectionState::Connected || !link.matches(peripheral_id) {
                return;
            }
            link.channel.clone()
        };
        if let Some(channel) = channel {
            if channel.deliver(uuid, &value) {
                self.bus
                    .publish(DeviceEvent::CharacteristicUpdated { uuid, value });
            }
        }
    }
}

/// Abandons the attempt if `connect` is dropped before it resolves.
struct AttemptGuard<'a> {
    manager: &'a ConnectionManager,
    attempt: u64,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.manager.abandon(self.attempt) {
            info!("Connection attempt cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::peripheral::CharacteristicFlags;
    use crate::bluetooth::simulated::{ConnectOutcome, SimulatedRadio};

    const LED: Uuid = Uuid::from_u128(0x01);

    fn manager(radio: Arc<SimulatedRadio>) -> (Arc<ConnectionManager>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(32));
        let manager = Arc::new(ConnectionManager::new(
            radio,
            bus.clone(),
            Duration::from_secs(5),
        ));
        (manager, bus)
    }

    /// Feed radio callbacks to the manager, as the dispatcher would.
    fn pump(
        manager: Arc<ConnectionManager>,
        mut events: tokio::sync::mpsc::Receiver<crate::bluetooth::RadioEvent>,
    ) {
        use crate::bluetooth::RadioEvent;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RadioEvent::LinkEstablished {
                        peripheral_id,
                        characteristics,
                    } => manager.on_link_established(&peripheral_id, characteristics),
                    RadioEvent::LinkFailed {
                        peripheral_id,
                        reason,
                    } => manager.on_link_failed(&peripheral_id, &reason),
                    RadioEvent::LinkClosed { peripheral_id } => {
                        manager.on_link_closed(&peripheral_id)
                    }
                    _ => {}
                }
            }
        });
    }

    fn device(radio: &SimulatedRadio, id: &str) -> Peripheral {
        radio.add_peripheral(
            Peripheral::new(id),
            vec![Characteristic::new(LED, CharacteristicFlags::WRITE)],
        );
        Peripheral::new(id)
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (radio, events) = SimulatedRadio::new();
        let (manager, bus) = manager(radio.clone());
        pump(manager.clone(), events);
        let rx = bus.subscribe();
        let p = device(&radio, "AA:BB");

        manager.connect(p).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.channel().is_ok());

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.channel().err(), Some(BleError::NotConnected));

        let states: Vec<ConnectionState> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                DeviceEvent::ConnectionStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_refused() {
        let (radio, events) = SimulatedRadio::new();
        let (manager, _bus) = manager(radio.clone());
        pump(manager.clone(), events);
        let a = device(&radio, "AA:BB");
        let b = device(&radio, "CC:DD");

        manager.connect(a).await.unwrap();
        assert_eq!(manager.connect(b).await, Err(BleError::AlreadyConnected));
        assert_eq!(manager.peripheral().unwrap().id, "AA:BB");
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_link_failure_requires_acknowledge() {
        let (radio, events) = SimulatedRadio::new();
        let (manager, bus) = manager(radio.clone());
        pump(manager.clone(), events);
        let rx = bus.subscribe();
        let p = device(&radio, "AA:BB");
        radio.set_connect_outcome(ConnectOutcome::Reject("out of range".to_string()));

        let result = manager.connect(p.clone()).await;
        assert_eq!(result, Err(BleError::LinkFailed("out of range".to_string())));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(manager.connect(p).await, Err(BleError::AlreadyConnected));

        manager.acknowledge();
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let errors = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, DeviceEvent::ErrorOccurred(BleError::LinkFailed(_))))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_returns_to_disconnected() {
        let (radio, events) = SimulatedRadio::new();
        let (manager, _bus) = manager(radio.clone());
        pump(manager.clone(), events);
        let p = device(&radio, "AA:BB");
        radio.set_connect_outcome(ConnectOutcome::Ignore);

        assert_eq!(manager.connect(p).await, Err(BleError::Timeout));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_returns_to_disconnected() {
        let (radio, events) = SimulatedRadio::new();
        let (manager, _bus) = manager(radio.clone());
        pump(manager.clone(), events);
        let p = device(&radio, "AA:BB");
        radio.set_connect_outcome(ConnectOutcome::Ignore);

        let attempt = tokio::time::timeout(Duration::from_millis(100), manager.connect(p)).await;
        assert!(attempt.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unsolicited_drop_reports_link_lost() {
        let (radio, events) = SimulatedRadio::new();
        let (manager, bus) = manager(radio.clone());
        pump(manager.clone(), events);
        let p = device(&radio, "AA:BB");
        manager.connect(p).await.unwrap();
        let channel = manager.channel().unwrap();
        let rx = bus.subscribe();

        manager.on_link_closed("AA:BB");
        manager.on_link_closed("AA:BB");

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!channel.is_open());
        let lost = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| *e == DeviceEvent::ErrorOccurred(BleError::LinkLost))
            .count();
        assert_eq!(lost, 1);
    }

    #[tokio::test]
    async fn test_radio_unavailable_refuses_connect() {
        let (radio, _events) = SimulatedRadio::new();
        let (manager, _bus) = manager(radio.clone());
        radio.set_available(false);

        assert_eq!(
            manager.connect(Peripheral::new("AA:BB")).await,
            Err(BleError::RadioUnavailable)
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let (radio, _events) = SimulatedRadio::new();
        let (manager, _bus) = manager(radio);
        assert!(manager.disconnect().await.is_ok());
    }
}

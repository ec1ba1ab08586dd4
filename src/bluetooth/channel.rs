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

//! Read, write and notify access to the connected peripheral's characteristics.

use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::BleError;
use super::event_bus::{DeviceEvent, EventBus};
use super::peripheral::{Characteristic, CharacteristicFlags, Peripheral};
use super::radio::{bounded, RadioStack};

/// Characteristic access for one established link.
///
/// The link carries a single request at a time, so operations wait their
/// turn on a queue. Each one, queueing included, is bounded by the
/// operation timeout. Once the link is gone every operation fails with
/// `NotConnected` and all subscriptions end. Timeouts are also published
/// on the event bus.
pub struct CharacteristicChannel {
    peripheral: Peripheral,
    radio: Arc<dyn RadioStack>,
    bus: Arc<EventBus>,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    subscribers: Mutex<HashMap<Uuid, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    queue: tokio::sync::Mutex<()>,
    closed: watch::Sender<bool>,
    operation_timeout: Duration,
}

impl CharacteristicChannel {
    pub fn new(
        peripheral: Peripheral,
        characteristics: Vec<Characteristic>,
        radio: Arc<dyn RadioStack>,
        bus: Arc<EventBus>,
        operation_timeout: Duration,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            peripheral,
            radio,
            bus,
            characteristics: Mutex::new(
                characteristics
                    .into_iter()
                    .map(|c| (c.uuid, c))
                    .collect(),
            ),
            subscribers: Mutex::new(HashMap::new()),
            queue: tokio::sync::Mutex::new(()),
            closed,
            operation_timeout,
        }
    }

    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Characteristics resolved when the link came up.
    pub fn characteristics(&self) -> Vec<Characteristic> {
        self.characteristics.lock().values().cloned().collect()
    }

    /// Last value read, written or notified.
    pub fn last_value(&self, uuid: Uuid) -> Option<Vec<u8>> {
        self.characteristics
            .lock()
            .get(&uuid)
            .and_then(|c| c.value.clone())
    }

    fn flags(&self, uuid: Uuid) -> Result<CharacteristicFlags, BleError> {
        if !self.is_open() {
            return Err(BleError::NotConnected);
        }
        self.characteristics
            .lock()
            .get(&uuid)
            .map(|c| c.flags)
            .ok_or(BleError::UnknownCharacteristic(uuid))
    }

    fn remember(&self, uuid: Uuid, value: &[u8]) {
        if let Some(c) = self.characteristics.lock().get_mut(&uuid) {
            c.value = Some(value.to_vec());
        }
    }

    /// Wait for the queue, then run `request`, all within the timeout.
    async fn queued<T, F>(&self, request: F) -> Result<T, BleError>
    where
        F: Future<Output = Result<T, BleError>>,
    {
        let mut closed = self.closed.subscribe();
        let turn = async {
            let _turn = self.queue.lock().await;
            if !self.is_open() {
                return Err(BleError::NotConnected);
            }
            request.await
        };

        let result = tokio::select! {
            result = bounded(self.operation_timeout, turn) => result,
            _ = closed.wait_for(|closed| *closed) => Err(BleError::NotConnected),
        };
        if let Err(BleError::Timeout) = result {
            warn!("Operation on {} timed out", self.peripheral.id);
            self.bus.publish(DeviceEvent::ErrorOccurred(BleError::Timeout));
        }
        result
    }

    pub async fn write(&self, uuid: Uuid, value: &[u8]) -> Result<(), BleError> {
        if !self.flags(uuid)?.writable {
            return Err(BleError::NotWritable(uuid));
        }
        debug!("Writing {} byte(s) to {}", value.len(), uuid);
        self.queued(self.radio.write(&self.peripheral.id, uuid, value))
            .await?;
        self.remember(uuid, value);
        Ok(())
    }

    pub async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, BleError> {
        if !self.flags(uuid)?.readable {
            return Err(BleError::NotReadable(uuid));
        }
        let value = self
            .queued(self.radio.read(&self.peripheral.id, uuid))
            .await?;
        debug!("Read {} byte(s) from {}", value.len(), uuid);
        self.remember(uuid, &value);
        Ok(value)
    }

    /// Stream of notified values; ends when the link goes down.
    pub async fn subscribe(&self, uuid: Uuid) -> Result<Subscription, BleError> {
        if !self.flags(uuid)?.notifiable {
            return Err(BleError::NotNotifiable(uuid));
        }

        let enabled = self
            .subscribers
            .lock()
            .get(&uuid)
            .is_some_and(|subs| !subs.is_empty());
        if !enabled {
            self.queued(self.radio.subscribe(&self.peripheral.id, uuid))
                .await?;
            info!("Notifications enabled for {}", uuid);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock();
        if !self.is_open() {
            return Err(BleError::NotConnected);
        }
        subscribers.entry(uuid).or_default().push(tx);
        Ok(Subscription { uuid, rx })
    }

    /// Hand a notified value to subscribers. Returns false for unknown characteristics.
    pub fn deliver(&self, uuid: Uuid, value: &[u8]) -> bool {
        if !self.characteristics.lock().contains_key(&uuid) {
            return false;
        }
        self.remember(uuid, value);
        if let Some(subs) = self.subscribers.lock().get_mut(&uuid) {
            subs.retain(|tx| tx.send(value.to_vec()).is_ok());
        }
        true
    }

    /// Invalidate the channel. Pending operations fail and subscriptions end.
    pub fn close(&self) {
        self.closed.send_replace(true);
        self.subscribers.lock().clear();
    }
}

/// Notified values of one characteristic.
///
/// Ends for good once the link drops; subscribe again on a new link.
#[derive(Debug)]
pub struct Subscription {
    uuid: Uuid,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl Stream for Subscription {
    type Item = Vec<u8>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

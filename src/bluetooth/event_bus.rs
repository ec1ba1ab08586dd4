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

//! Single-subscriber event bus.

use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::ConnectionState;
use super::error::BleError;
use super::peripheral::Peripheral;

/// Why a scan session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEndReason {
    /// The session duration elapsed.
    Completed,
    /// `stop()` was called.
    Stopped,
    /// The radio stack aborted the scan.
    Failed,
}

/// Events published to the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A peripheral was seen (first sighting or refresh).
    PeripheralDiscovered(Peripheral),
    /// A scan session ended.
    ScanEnded {
        reason: ScanEndReason,
        discovered: usize,
    },
    /// The connection moved to a new state.
    ConnectionStateChanged {
        state: ConnectionState,
        peripheral: Option<Peripheral>,
    },
    /// A characteristic value was notified.
    CharacteristicUpdated { uuid: Uuid, value: Vec<u8> },
    /// A link-level error the caller should know about.
    ErrorOccurred(BleError),
}

/// Buffered events per subscriber when none is configured.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Receiving end handed to the subscriber.
pub type EventReceiver = Receiver<DeviceEvent>;

/// Publishes events to at most one subscriber.
///
/// Publishing never blocks. Without a subscriber, or with a full buffer,
/// the event is dropped; scanner and connection state stay queryable.
pub struct EventBus {
    subscriber: Mutex<Option<Sender<DeviceEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscriber: Mutex::new(None),
            capacity: capacity.max(1),
        }
    }

    /// Attach a subscriber, detaching any previous one.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = async_channel::bounded(self.capacity);
        if let Some(previous) = self.subscriber.lock().replace(tx) {
            previous.close();
            debug!("Previous event subscriber replaced");
        }
        rx
    }

    /// Detach the current subscriber.
    pub fn unsubscribe(&self) {
        if let Some(previous) = self.subscriber.lock().take() {
            previous.close();
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Deliver an event without waiting.
    pub fn publish(&self, event: DeviceEvent) {
        let mut subscriber = self.subscriber.lock();
        let Some(tx) = subscriber.as_ref() else {
            debug!("No subscriber, dropping {:?}", event);
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event subscriber lagging, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event subscriber gone");
                *subscriber = None;
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ended() -> DeviceEvent {
        DeviceEvent::ScanEnded {
            reason: ScanEndReason::Completed,
            discovered: 0,
        }
    }

    #[test]
    fn test_publish_without_subscriber_is_dropped() {
        let bus = EventBus::new(4);
        bus.publish(ended());

        let rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_delivers_in_order() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe();

        bus.publish(DeviceEvent::ErrorOccurred(BleError::Timeout));
        bus.publish(ended());

        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::ErrorOccurred(BleError::Timeout)
        );
        assert_eq!(rx.try_recv().unwrap(), ended());
    }

    #[test]
    fn test_full_buffer_never_blocks() {
        let bus = EventBus::new(2);
        let rx = bus.subscribe();

        for _ in 0..10 {
            bus.publish(ended());
        }

        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_new_subscriber_replaces_old() {
        let bus = EventBus::new(4);
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.publish(ended());

        assert!(first.is_closed());
        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap(), ended());
    }

    #[test]
    fn test_dropped_subscriber_detaches() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe();
        assert!(bus.has_subscriber());

        drop(rx);
        bus.publish(ended());
        assert!(!bus.has_subscriber());
    }
}

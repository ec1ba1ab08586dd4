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

//! Bluetooth module.
//!
//! BLE central role: scans for the smart device, holds one link to it and
//! exchanges characteristic values. Everything observable is reported as a
//! [`DeviceEvent`] on the event bus.

pub mod ble_constants;
mod bluez;
mod channel;
mod connection;
mod device;
mod error;
mod event_bus;
mod manager;
mod peripheral;
mod radio;
mod scanner;
mod simulated;

pub use bluez::{BluezRadio, SCAN_FAILED_INTERNAL_ERROR};
pub use channel::{CharacteristicChannel, Subscription};
pub use connection::{ConnectionManager, ConnectionState};
pub use device::{decode_counter, Counter, GattProfile, LedCommand};
pub use error::BleError;
pub use event_bus::{DeviceEvent, EventBus, EventReceiver, ScanEndReason, DEFAULT_EVENT_CAPACITY};
pub use manager::{BluetoothManager, ManagerOptions};
pub use peripheral::{Characteristic, CharacteristicFlags, Peripheral};
pub use radio::{bounded, RadioEvent, RadioGateway, RadioStack};
pub use scanner::{ScanSession, Scanner, ScannerOptions};
pub use simulated::{ConnectOutcome, SimulatedRadio};

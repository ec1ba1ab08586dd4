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

//! LED commands and button counters of the smart device.

use uuid::Uuid;

use super::ble_constants::{LED_UUID, MAIN_BUTTON_UUID, THIRD_BUTTON_UUID};

/// Payloads accepted by the LED characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LedCommand {
    Off = 0x00,
    Led1 = 0x01,
    Led2 = 0x02,
    Led3 = 0x03,
}

impl LedCommand {
    pub fn as_bytes(&self) -> Vec<u8> {
        vec![*self as u8]
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(LedCommand::Off),
            0x01 => Some(LedCommand::Led1),
            0x02 => Some(LedCommand::Led2),
            0x03 => Some(LedCommand::Led3),
            _ => None,
        }
    }

    pub fn is_on(&self) -> bool {
        *self != LedCommand::Off
    }
}

/// Click counters exposed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    MainButton,
    ThirdButton,
}

impl Counter {
    pub const ALL: [Counter; 2] = [Counter::MainButton, Counter::ThirdButton];

    pub fn label(&self) -> &'static str {
        match self {
            Counter::MainButton => "Main button",
            Counter::ThirdButton => "Third button",
        }
    }
}

/// Characteristic UUIDs of the device profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub led: Uuid,
    pub main_button: Uuid,
    pub third_button: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            led: LED_UUID,
            main_button: MAIN_BUTTON_UUID,
            third_button: THIRD_BUTTON_UUID,
        }
    }
}

impl GattProfile {
    pub fn counter(&self, counter: Counter) -> Uuid {
        match counter {
            Counter::MainButton => self.main_button,
            Counter::ThirdButton => self.third_button,
        }
    }

    /// Which counter, if any, a characteristic carries.
    pub fn counter_for(&self, uuid: Uuid) -> Option<Counter> {
        Counter::ALL.into_iter().find(|c| self.counter(*c) == uuid)
    }
}

/// Decode a counter payload: little-endian, one to four bytes.
pub fn decode_counter(payload: &[u8]) -> Option<u32> {
    if payload.is_empty() || payload.len() > 4 {
        return None;
    }
    let mut bytes = [0u8; 4];
    bytes[..payload.len()].copy_from_slice(payload);
    Some(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_led_payloads() {
        assert_eq!(LedCommand::Off.as_bytes(), vec![0x00]);
        assert_eq!(LedCommand::Led2.as_bytes(), vec![0x02]);
        assert_eq!(LedCommand::from_byte(0x03), Some(LedCommand::Led3));
        assert_eq!(LedCommand::from_byte(0x10), None);
        assert!(!LedCommand::Off.is_on());
    }

    #[test]
    fn test_decode_counter() {
        assert_eq!(decode_counter(&[3]), Some(3));
        assert_eq!(decode_counter(&[0x01, 0x01]), Some(257));
        assert_eq!(decode_counter(&[]), None);
        assert_eq!(decode_counter(&[0; 5]), None);
    }

    #[test]
    fn test_profile_lookup() {
        let profile = GattProfile::default();
        assert_eq!(profile.counter_for(THIRD_BUTTON_UUID), Some(Counter::ThirdButton));
        assert_eq!(profile.counter_for(LED_UUID), None);
    }
}

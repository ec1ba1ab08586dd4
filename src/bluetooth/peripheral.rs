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

//! Peripheral and characteristic descriptions.

use chrono::{DateTime, Local};
use uuid::Uuid;

/// A remote BLE device seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct Peripheral {
    /// Hardware address, e.g. `AA:BB:CC:DD:EE:FF`.
    pub id: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength of the last sighting.
    pub rssi: Option<i16>,
    /// Time of the last sighting.
    pub last_seen: DateTime<Local>,
}

impl Peripheral {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
            last_seen: Local::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Name to show in lists, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Merge a newer sighting of the same device.
    ///
    /// A name learned earlier survives a nameless advertisement.
    pub fn refresh(&mut self, sighting: Peripheral) {
        if sighting.name.is_some() {
            self.name = sighting.name;
        }
        if sighting.rssi.is_some() {
            self.rssi = sighting.rssi;
        }
        self.last_seen = sighting.last_seen;
    }
}

/// Operations a characteristic supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicFlags {
    pub readable: bool,
    pub writable: bool,
    pub notifiable: bool,
}

impl CharacteristicFlags {
    pub const READ: Self = Self {
        readable: true,
        writable: false,
        notifiable: false,
    };

    pub const WRITE: Self = Self {
        readable: false,
        writable: true,
        notifiable: false,
    };

    pub const READ_NOTIFY: Self = Self {
        readable: true,
        writable: false,
        notifiable: true,
    };

    pub const READ_WRITE: Self = Self {
        readable: true,
        writable: true,
        notifiable: false,
    };
}

/// A characteristic exposed by the connected peripheral.
#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub flags: CharacteristicFlags,
    /// Last value read, written or notified.
    pub value: Option<Vec<u8>>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, flags: CharacteristicFlags) -> Self {
        Self {
            uuid,
            flags,
            value: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_keeps_known_name() {
        let mut p = Peripheral::new("AA:BB").with_name("P2PSRV1").with_rssi(-70);
        p.refresh(Peripheral::new("AA:BB").with_rssi(-55));

        assert_eq!(p.name.as_deref(), Some("P2PSRV1"));
        assert_eq!(p.rssi, Some(-55));
    }

    #[test]
    fn test_display_name_falls_back_to_address() {
        let p = Peripheral::new("CC:DD");
        assert_eq!(p.display_name(), "CC:DD");
        assert_eq!(p.with_name("Lamp").display_name(), "Lamp");
    }
}

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

//! Default BLE characteristic UUIDs for the smart device.
//!
//! These follow the ST "P2P server" firmware used on the course boards.
//! They are only defaults; other firmware can override them in the config.

use uuid::Uuid;

/// LED characteristic UUID (central writes LED commands here).
/// Properties: Read, Write Without Response
pub const LED_UUID: Uuid = Uuid::from_u128(0x0000fe41_8e22_4541_9d4c_21edae82ed19);

/// Main button characteristic UUID (click counter).
/// Properties: Notify
pub const MAIN_BUTTON_UUID: Uuid = Uuid::from_u128(0x0000fe42_8e22_4541_9d4c_21edae82ed19);

/// Third button characteristic UUID (click counter).
/// Properties: Read, Notify
pub const THIRD_BUTTON_UUID: Uuid = Uuid::from_u128(0x0000fe43_8e22_4541_9d4c_21edae82ed19);

/// Timing defaults.
pub mod timing {
    /// Scan window when none is configured (seconds).
    pub const DEFAULT_SCAN_SECS: u64 = 50;

    /// Bound on every radio request (milliseconds).
    pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            MAIN_BUTTON_UUID.to_string(),
            "0000fe42-8e22-4541-9d4c-21edae82ed19"
        );
        assert_eq!(LED_UUID.to_string(), "0000fe41-8e22-4541-9d4c-21edae82ed19");
    }

    #[test]
    fn test_characteristics_distinct() {
        assert_ne!(LED_UUID, MAIN_BUTTON_UUID);
        assert_ne!(MAIN_BUTTON_UUID, THIRD_BUTTON_UUID);
    }
}

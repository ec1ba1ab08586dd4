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

//! Error type shared by the BLE central components.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the scanner, connection manager and characteristic channel.
///
/// None of these are retried by the core. Misuse guards (`AlreadyScanning`,
/// `AlreadyConnected`) are returned to the caller; link-level failures are
/// additionally published on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// No adapter present, or the adapter is powered off.
    #[error("radio unavailable")]
    RadioUnavailable,

    /// A scan session is already running.
    #[error("a scan is already in progress")]
    AlreadyScanning,

    /// The connection slot is not in the Disconnected state.
    #[error("already connected or connecting")]
    AlreadyConnected,

    /// No established link.
    #[error("not connected")]
    NotConnected,

    /// The characteristic does not support reads.
    #[error("characteristic {0} is not readable")]
    NotReadable(Uuid),

    /// The characteristic does not support writes.
    #[error("characteristic {0} is not writable")]
    NotWritable(Uuid),

    /// The characteristic does not support notifications.
    #[error("characteristic {0} does not support notifications")]
    NotNotifiable(Uuid),

    /// The peripheral does not expose this characteristic.
    #[error("unknown characteristic {0}")]
    UnknownCharacteristic(Uuid),

    /// The radio did not answer within the operation bound.
    #[error("operation timed out")]
    Timeout,

    /// The link dropped without being asked to.
    #[error("link lost")]
    LinkLost,

    /// The platform refused access to the radio.
    #[error("bluetooth permission denied")]
    PermissionDenied,

    /// The platform aborted the scan with an error code.
    #[error("scan failed with code {0}")]
    ScanFailed(i32),

    /// The link could not be established.
    #[error("connection failed: {0}")]
    LinkFailed(String),

    /// Any other platform stack error.
    #[error("bluetooth stack error: {0}")]
    Platform(String),
}

impl BleError {
    /// Whether this error comes from the link rather than from caller misuse.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            BleError::Timeout | BleError::LinkLost | BleError::LinkFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(BleError::RadioUnavailable.to_string(), "radio unavailable");
        let id = Uuid::from_u128(0x2a37);
        assert!(BleError::NotWritable(id).to_string().contains(&id.to_string()));
        assert_eq!(BleError::ScanFailed(2).to_string(), "scan failed with code 2");
    }

    #[test]
    fn test_link_errors() {
        assert!(BleError::Timeout.is_link_error());
        assert!(BleError::LinkLost.is_link_error());
        assert!(!BleError::AlreadyConnected.is_link_error());
        assert!(!BleError::PermissionDenied.is_link_error());
    }
}

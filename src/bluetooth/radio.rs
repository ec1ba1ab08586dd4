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

//! Boundary to the platform radio stack.
//!
//! Requests go through [`RadioStack`]; completions and unsolicited
//! callbacks come back as [`RadioEvent`]s on a channel that a single
//! background task drains in order.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::error::BleError;
use super::peripheral::{Characteristic, Peripheral};

/// Callbacks from the radio stack.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// An advertisement was received while scanning.
    Discovered(Peripheral),
    /// The platform aborted the scan.
    ScanFailed(i32),
    /// A requested link is up and its characteristics are resolved.
    LinkEstablished {
        peripheral_id: String,
        characteristics: Vec<Characteristic>,
    },
    /// A requested link could not be established.
    LinkFailed { peripheral_id: String, reason: String },
    /// A link went down, requested or not.
    LinkClosed { peripheral_id: String },
    /// A subscribed characteristic changed.
    Notification {
        peripheral_id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Platform BLE stack in the central role.
///
/// `connect` and `disconnect` only issue the request; the outcome arrives
/// as a [`RadioEvent`]. Reads and writes resolve directly.
#[async_trait]
pub trait RadioStack: Send + Sync {
    /// Backend name for logging (e.g., "BlueZ").
    fn backend_name(&self) -> &'static str;

    /// Whether a radio adapter exists.
    async fn is_available(&self) -> bool;

    /// Whether the adapter is powered on.
    async fn is_enabled(&self) -> bool;

    /// Whether the process may scan and connect.
    async fn check_permissions(&self) -> Result<(), BleError> {
        Ok(())
    }

    async fn start_scan(&self) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    async fn connect(&self, peripheral_id: &str) -> Result<(), BleError>;

    async fn disconnect(&self, peripheral_id: &str) -> Result<(), BleError>;

    async fn read(&self, peripheral_id: &str, characteristic: Uuid) -> Result<Vec<u8>, BleError>;

    async fn write(
        &self,
        peripheral_id: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError>;

    /// Enable notifications; values arrive as [`RadioEvent::Notification`].
    async fn subscribe(&self, peripheral_id: &str, characteristic: Uuid) -> Result<(), BleError>;
}

/// Availability checks in front of the radio stack.
///
/// Fails closed: anything short of a present, powered adapter is a single
/// `RadioUnavailable`. Radio-off is fixed by the user, so nothing retries.
#[derive(Clone)]
pub struct RadioGateway {
    radio: Arc<dyn RadioStack>,
}

impl RadioGateway {
    pub fn new(radio: Arc<dyn RadioStack>) -> Self {
        Self { radio }
    }

    pub async fn is_available(&self) -> bool {
        self.radio.is_available().await
    }

    pub async fn is_enabled(&self) -> bool {
        self.radio.is_enabled().await
    }

    /// Refuse to proceed unless the radio is present, powered and permitted.
    pub async fn ensure_ready(&self) -> Result<(), BleError> {
        if !self.is_available().await || !self.is_enabled().await {
            warn!("{} radio unavailable", self.radio.backend_name());
            return Err(BleError::RadioUnavailable);
        }
        self.radio.check_permissions().await
    }
}

/// Run a radio request, failing with `Timeout` once `limit` has passed.
pub async fn bounded<T, F>(limit: Duration, request: F) -> Result<T, BleError>
where
    F: Future<Output = Result<T, BleError>>,
{
    tokio::time::timeout(limit, request)
        .await
        .map_err(|_| BleError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::simulated::SimulatedRadio;

    #[tokio::test]
    async fn test_gateway_ready() {
        let (radio, _events) = SimulatedRadio::new();
        let gateway = RadioGateway::new(radio);
        assert!(gateway.ensure_ready().await.is_ok());
    }

    #[tokio::test]
    async fn test_gateway_fails_closed() {
        let (radio, _events) = SimulatedRadio::new();
        radio.set_enabled(false);
        let gateway = RadioGateway::new(radio.clone());
        assert_eq!(gateway.ensure_ready().await, Err(BleError::RadioUnavailable));

        radio.set_enabled(true);
        radio.set_available(false);
        assert_eq!(gateway.ensure_ready().await, Err(BleError::RadioUnavailable));
    }

    #[tokio::test]
    async fn test_gateway_permission_denied() {
        let (radio, _events) = SimulatedRadio::new();
        radio.set_permitted(false);
        let gateway = RadioGateway::new(radio);
        assert_eq!(gateway.ensure_ready().await, Err(BleError::PermissionDenied));
    }
}

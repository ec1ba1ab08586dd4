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

//! BlueZ radio stack (central role).

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic as RemoteCharacteristic;
use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent as BluezDeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport, ErrorKind,
};
use futures::stream::FuturesUnordered;
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::BleError;
use super::peripheral::{Characteristic, CharacteristicFlags, Peripheral};
use super::radio::{RadioEvent, RadioStack};

/// Scan failure code reported when BlueZ ends discovery on its own.
/// Matches the platform "internal error" code.
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

fn map_error(err: bluer::Error) -> BleError {
    match err.kind {
        ErrorKind::NotPermitted | ErrorKind::NotAuthorized => BleError::PermissionDenied,
        _ => BleError::Platform(err.to_string()),
    }
}

fn parse_address(peripheral_id: &str) -> Result<Address, BleError> {
    peripheral_id
        .parse()
        .map_err(|_| BleError::Platform(format!("invalid device address {}", peripheral_id)))
}

/// Background work tied to one peripheral.
#[derive(Default)]
struct LinkTasks {
    /// Connects, then watches the link until it goes down.
    connect: Option<JoinHandle<()>>,
    notifiers: Vec<JoinHandle<()>>,
}

impl LinkTasks {
    fn abort(self) {
        self.connect
            .into_iter()
            .chain(self.notifiers)
            .for_each(|task| task.abort());
    }
}

type CharacteristicMap = Arc<Mutex<HashMap<(String, Uuid), RemoteCharacteristic>>>;

/// Radio stack backed by the BlueZ daemon over D-Bus.
pub struct BluezRadio {
    adapter: Adapter,
    events: mpsc::Sender<RadioEvent>,
    scan: Mutex<Option<JoinHandle<()>>>,
    links: Mutex<HashMap<String, LinkTasks>>,
    characteristics: CharacteristicMap,
}

impl BluezRadio {
    /// Open a BlueZ session on the named adapter, or the default one.
    pub async fn open(
        adapter_name: Option<&str>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<RadioEvent>), BleError> {
        info!("Initializing BlueZ central...");

        let session = bluer::Session::new().await.map_err(map_error)?;
        debug!("BlueZ session created");

        let adapter = match adapter_name {
            Some(name) => session.adapter(name).map_err(map_error)?,
            None => session.default_adapter().await.map_err(map_error)?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        let (events, rx) = mpsc::channel(256);
        let radio = Arc::new(Self {
            adapter,
            events,
            scan: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
        });
        Ok((radio, rx))
    }

    fn device(&self, peripheral_id: &str) -> Result<Device, BleError> {
        let address = parse_address(peripheral_id)?;
        self.adapter.device(address).map_err(map_error)
    }

    fn remote(&self, peripheral_id: &str, uuid: Uuid) -> Result<RemoteCharacteristic, BleError> {
        self.characteristics
            .lock()
            .get(&(peripheral_id.to_string(), uuid))
            .cloned()
            .ok_or(BleError::UnknownCharacteristic(uuid))
    }

    fn forget(&self, peripheral_id: &str) {
        if let Some(tasks) = self.links.lock().remove(peripheral_id) {
            tasks.abort();
        }
        self.characteristics
            .lock()
            .retain(|(id, _), _| id != peripheral_id);
    }
}

/// Read name and signal strength of a freshly seen device.
async fn describe(adapter: &Adapter, address: Address) -> Result<Peripheral, bluer::Error> {
    let device = adapter.device(address)?;
    let mut peripheral = Peripheral::new(address.to_string());
    if let Some(name) = device.name().await? {
        peripheral = peripheral.with_name(name);
    }
    if let Some(rssi) = device.rssi().await? {
        peripheral = peripheral.with_rssi(rssi);
    }
    Ok(peripheral)
}

/// Property changes that make a sighting worth reporting again.
fn is_refresh(property: &DeviceProperty) -> bool {
    matches!(property, DeviceProperty::Rssi(_) | DeviceProperty::Name(_))
}

/// Describe a device and report it. Returns false once nobody listens.
async fn report(adapter: &Adapter, address: Address, events: &mpsc::Sender<RadioEvent>) -> bool {
    match describe(adapter, address).await {
        Ok(peripheral) => events.send(RadioEvent::Discovered(peripheral)).await.is_ok(),
        Err(e) => {
            debug!("Skipping {}: {}", address, e);
            true
        }
    }
}

/// Report a known device again whenever its signal strength or name changes.
async fn follow_sightings(adapter: Adapter, address: Address, events: mpsc::Sender<RadioEvent>) {
    let Ok(device) = adapter.device(address) else {
        return;
    };
    let Ok(changes) = device.events().await else {
        return;
    };
    pin_mut!(changes);
    while let Some(BluezDeviceEvent::PropertyChanged(property)) = changes.next().await {
        if is_refresh(&property) && !report(&adapter, address, &events).await {
            return;
        }
    }
}

/// Connect and collect every characteristic of every service.
async fn establish(
    device: &Device,
) -> Result<Vec<(Characteristic, RemoteCharacteristic)>, bluer::Error> {
    if !device.is_connected().await? {
        device.connect().await?;
    }

    let mut found = Vec::new();
    for service in device.services().await? {
        for remote in service.characteristics().await? {
            let uuid = remote.uuid().await?;
            let flags = remote.flags().await?;
            let characteristic = Characteristic::new(
                uuid,
                CharacteristicFlags {
                    readable: flags.read,
                    writable: flags.write || flags.write_without_response,
                    notifiable: flags.notify || flags.indicate,
                },
            );
            found.push((characteristic, remote));
        }
    }
    Ok(found)
}

#[async_trait]
impl RadioStack for BluezRadio {
    fn backend_name(&self) -> &'static str {
        "BlueZ"
    }

    async fn is_available(&self) -> bool {
        self.adapter.address().await.is_ok()
    }

    async fn is_enabled(&self) -> bool {
        self.adapter.is_powered().await.unwrap_or(false)
    }

    async fn check_permissions(&self) -> Result<(), BleError> {
        self.adapter.is_discovering().await.map(|_| ()).map_err(map_error)
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        self.adapter
            .set_discovery_filter(filter)
            .await
            .map_err(map_error)?;

        let stream = self.adapter.discover_devices().await.map_err(map_error)?;
        info!("BLE discovery started");

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            pin_mut!(stream);
            // Dropped with this task when the scan stops.
            let mut sightings = FuturesUnordered::new();
            loop {
                tokio::select! {
                    event = stream.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            if !report(&adapter, address, &events).await {
                                return;
                            }
                            sightings.push(follow_sightings(
                                adapter.clone(),
                                address,
                                events.clone(),
                            ));
                        }
                        Some(_) => {}
                        None => break,
                    },
                    Some(()) = sightings.next(), if !sightings.is_empty() => {}
                }
            }
            warn!("BlueZ ended discovery");
            let _ = events
                .send(RadioEvent::ScanFailed(SCAN_FAILED_INTERNAL_ERROR))
                .await;
        });

        if let Some(previous) = self.scan.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(task) = self.scan.lock().take() {
            task.abort();
            info!("BLE discovery stopped");
        }
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<(), BleError> {
        let device = self.device(peripheral_id)?;
        let id = peripheral_id.to_string();
        let events = self.events.clone();
        let characteristics = self.characteristics.clone();

        let connect = tokio::spawn(async move {
            let event = match establish(&device).await {
                Ok(found) => {
                    let mut resolved = Vec::with_capacity(found.len());
                    {
                        let mut map = characteristics.lock();
                        for (characteristic, remote) in found {
                            map.insert((id.clone(), characteristic.uuid), remote);
                            resolved.push(characteristic);
                        }
                    }
                    RadioEvent::LinkEstablished {
                        peripheral_id: id.clone(),
                        characteristics: resolved,
                    }
                }
                Err(e) => {
                    error!("Connection to {} failed: {}", id, e);
                    RadioEvent::LinkFailed {
                        peripheral_id: id.clone(),
                        reason: e.to_string(),
                    }
                }
            };
            let established = matches!(event, RadioEvent::LinkEstablished { .. });
            if events.send(event).await.is_err() || !established {
                return;
            }

            // Report the link going down, requested or not.
            let Ok(device_events) = device.events().await else {
                return;
            };
            pin_mut!(device_events);
            while let Some(BluezDeviceEvent::PropertyChanged(property)) =
                device_events.next().await
            {
                if let DeviceProperty::Connected(false) = property {
                    info!("Link to {} closed", id);
                    let _ = events
                        .send(RadioEvent::LinkClosed { peripheral_id: id })
                        .await;
                    return;
                }
            }
        });

        let mut links = self.links.lock();
        let tasks = links.entry(peripheral_id.to_string()).or_default();
        if let Some(previous) = tasks.connect.replace(connect) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<(), BleError> {
        let device = self.device(peripheral_id)?;
        let connected = device.is_connected().await.map_err(map_error)?;
        self.forget(peripheral_id);

        if connected {
            device.disconnect().await.map_err(map_error)?;
        }
        // The link watcher was aborted above, so report the close here.
        let _ = self
            .events
            .send(RadioEvent::LinkClosed {
                peripheral_id: peripheral_id.to_string(),
            })
            .await;
        Ok(())
    }

    async fn read(&self, peripheral_id: &str, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        let remote = self.remote(peripheral_id, characteristic)?;
        remote.read().await.map_err(map_error)
    }

    async fn write(
        &self,
        peripheral_id: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let remote = self.remote(peripheral_id, characteristic)?;
        remote.write(value).await.map_err(map_error)
    }

    async fn subscribe(&self, peripheral_id: &str, characteristic: Uuid) -> Result<(), BleError> {
        let remote = self.remote(peripheral_id, characteristic)?;
        let stream = remote.notify().await.map_err(map_error)?;
        debug!("Subscribed to {} on {}", characteristic, peripheral_id);

        let id = peripheral_id.to_string();
        let events = self.events.clone();
        let notifier = tokio::spawn(async move {
            pin_mut!(stream);
            while let Some(value) = stream.next().await {
                let event = RadioEvent::Notification {
                    peripheral_id: id.clone(),
                    characteristic,
                    value,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        });

        self.links
            .lock()
            .entry(peripheral_id.to_string())
            .or_default()
            .notifiers
            .push(notifier);
        Ok(())
    }
}

impl Drop for BluezRadio {
    fn drop(&mut self) {
        if let Some(task) = self.scan.get_mut().take() {
            task.abort();
        }
        for (_, tasks) in self.links.get_mut().drain() {
            tasks.abort();
        }
    }
}

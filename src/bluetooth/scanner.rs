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

//! Time-bounded peripheral discovery.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::BleError;
use super::event_bus::{DeviceEvent, EventBus, ScanEndReason};
use super::peripheral::Peripheral;
use super::radio::{bounded, RadioGateway, RadioStack};

/// One scan run: when it started, how long it may last, what it found.
#[derive(Debug)]
pub struct ScanSession {
    started_at: DateTime<Local>,
    duration: Duration,
    peripherals: HashMap<String, Peripheral>,
}

impl ScanSession {
    pub fn new(duration: Duration) -> Self {
        Self {
            started_at: Local::now(),
            duration,
            peripherals: HashMap::new(),
        }
    }

    /// Insert or refresh a peripheral by id. Returns the stored entry.
    pub fn upsert(&mut self, sighting: Peripheral) -> &Peripheral {
        match self.peripherals.entry(sighting.id.clone()) {
            Entry::Occupied(entry) => {
                let known = entry.into_mut();
                known.refresh(sighting);
                known
            }
            Entry::Vacant(entry) => entry.insert(sighting),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peripherals.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Peripheral> {
        self.peripherals.get(id)
    }

    pub fn peripherals(&self) -> Vec<Peripheral> {
        self.peripherals.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Scanner settings.
#[derive(Debug, Clone)]
pub struct ScannerOptions {
    /// Bound on each radio request.
    pub operation_timeout: Duration,
    /// Ignore peripherals that never advertised a name.
    pub named_only: bool,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            named_only: false,
        }
    }
}

#[derive(Default)]
struct ScanState {
    session: Option<ScanSession>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct ScanShared {
    radio: Arc<dyn RadioStack>,
    gateway: RadioGateway,
    bus: Arc<EventBus>,
    options: ScannerOptions,
    state: Mutex<ScanState>,
}

impl ScanShared {
    /// Close the session of `generation` (any session when `None`).
    ///
    /// The session is taken under the lock, so each one ends exactly once.
    fn take_session(&self, generation: Option<u64>, reason: ScanEndReason) -> Option<ScanSession> {
        let mut state = self.state.lock();
        if generation.is_some_and(|g| g != state.generation) {
            return None;
        }
        let session = state.session.take()?;
        if let Some(timer) = state.timer.take() {
            // The timer ends its own session and must not cancel itself.
            if reason != ScanEndReason::Completed {
                timer.abort();
            }
        }
        Some(session)
    }

    fn publish_end(&self, reason: ScanEndReason, session: &ScanSession) {
        info!(
            "Scan started {} ({:?} window) ended ({:?}) with {} peripheral(s)",
            session.started_at().format("%H:%M:%S"),
            session.duration(),
            reason,
            session.len()
        );
        self.bus.publish(DeviceEvent::ScanEnded {
            reason,
            discovered: session.len(),
        });
    }

    async fn end(&self, generation: Option<u64>, reason: ScanEndReason) -> Result<(), BleError> {
        let Some(session) = self.take_session(generation, reason) else {
            return Ok(());
        };

        let result = bounded(self.options.operation_timeout, self.radio.stop_scan()).await;
        if let Err(e) = &result {
            warn!("Failed to stop radio scan: {}", e);
        }

        self.publish_end(reason, &session);
        result
    }

    /// Stop the radio unless a newer session owns it.
    async fn stop_radio(&self) {
        if self.state.lock().session.is_some() {
            return;
        }
        if let Err(e) = bounded(self.options.operation_timeout, self.radio.stop_scan()).await {
            debug!("Radio scan teardown failed: {}", e);
        }
    }

    /// Best-effort `stop_radio` in the background.
    fn teardown(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to stop the radio scan");
            return;
        };
        let shared = self.clone();
        runtime.spawn(async move { shared.stop_radio().await });
    }

    /// End a session whose start never finished and stop the radio.
    /// Returns whether anything was abandoned.
    fn abandon(self: &Arc<Self>, generation: u64) -> bool {
        let Some(session) = self.take_session(Some(generation), ScanEndReason::Stopped) else {
            return false;
        };
        self.publish_end(ScanEndReason::Stopped, &session);
        self.teardown();
        true
    }
}

/// Abandons the session if `start` is dropped before the radio answers.
struct StartGuard<'a> {
    shared: &'a Arc<ScanShared>,
    generation: u64,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.shared.abandon(self.generation) {
            info!("Scan start cancelled");
        }
    }
}

/// Discovers advertising peripherals, one session at a time.
#[derive(Clone)]
pub struct Scanner {
    shared: Arc<ScanShared>,
}

impl Scanner {
    pub fn new(radio: Arc<dyn RadioStack>, bus: Arc<EventBus>, options: ScannerOptions) -> Self {
        Self {
            shared: Arc::new(ScanShared {
                gateway: RadioGateway::new(radio.clone()),
                radio,
                bus,
                options,
                state: Mutex::new(ScanState::default()),
            }),
        }
    }

    /// Start a session that stops by itself after `duration`.
    pub async fn start(&self, duration: Duration) -> Result<(), BleError> {
        self.shared.gateway.ensure_ready().await?;

        let generation = {
            let mut state = self.shared.state.lock();
            if state.session.is_some() {
                return Err(BleError::AlreadyScanning);
            }
            state.generation += 1;
            state.session = Some(ScanSession::new(duration));
            state.generation
        };

        let mut guard = StartGuard {
            shared: &self.shared,
            generation,
            armed: true,
        };
        let started = bounded(
            self.shared.options.operation_timeout,
            self.shared.radio.start_scan(),
        )
        .await;
        guard.armed = false;

        if let Err(e) = started {
            warn!("Radio refused to scan: {}", e);
            self.shared.take_session(Some(generation), ScanEndReason::Failed);
            if e == BleError::Timeout {
                // The radio may still come up after the bound.
                self.shared
                    .bus
                    .publish(DeviceEvent::ErrorOccurred(BleError::Timeout));
                self.shared.stop_radio().await;
            }
            return Err(e);
        }

        let shared = self.shared.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = shared
                .end(Some(generation), ScanEndReason::Completed)
                .await
            {
                debug!("Scan timer stop error: {}", e);
            }
        });

        {
            let mut state = self.shared.state.lock();
            if state.generation == generation && state.session.is_some() {
                state.timer = Some(timer);
                info!("Scan started for {:?}", duration);
                return Ok(());
            }
        }

        // Stopped while the radio was starting. That stop already published
        // ScanEnded but reached the radio before it was up.
        timer.abort();
        debug!("Scan stopped during start, stopping the radio again");
        self.shared.stop_radio().await;
        Ok(())
    }

    /// Stop the current session. Does nothing when idle.
    pub async fn stop(&self) -> Result<(), BleError> {
        self.shared.end(None, ScanEndReason::Stopped).await
    }

    /// Start when idle, stop when scanning. Returns whether a scan is now running.
    pub async fn toggle(&self, duration: Duration) -> Result<bool, BleError> {
        if self.is_scanning() {
            self.stop().await?;
            Ok(false)
        } else {
            self.start(duration).await?;
            Ok(true)
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.state.lock().session.is_some()
    }

    /// Snapshot of the active session's peripherals.
    pub fn peripherals(&self) -> Vec<Peripheral> {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map(ScanSession::peripherals)
            .unwrap_or_default()
    }

    /// Look up a peripheral in the active session.
    pub fn peripheral(&self, id: &str) -> Option<Peripheral> {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.get(id).cloned())
    }

    /// Radio callback: an advertisement was received.
    pub fn on_discovered(&self, sighting: Peripheral) {
        let stored = {
            let mut state = self.shared.state.lock();
            let Some(session) = state.session.as_mut() else {
                debug!("Ignoring {} outside a scan session", sighting.id);
                return;
            };
            if self.shared.options.named_only
                && sighting.name.is_none()
                && !session.contains(&sighting.id)
            {
                return;
            }
            session.upsert(sighting).clone()
        };

        debug!(
            "Discovered {} ({}) RSSI {:?}",
            stored.display_name(),
            stored.id,
            stored.rssi
        );
        self.shared
            .bus
            .publish(DeviceEvent::PeripheralDiscovered(stored));
    }

    /// Radio callback: the platform aborted the scan.
    pub fn on_scan_failed(&self, code: i32) {
        warn!("Scan failed with code {}", code);
        let session = self.shared.take_session(None, ScanEndReason::Failed);
        self.shared
            .bus
            .publish(DeviceEvent::ErrorOccurred(BleError::ScanFailed(code)));
        if let Some(session) = session {
            self.shared.bus.publish(DeviceEvent::ScanEnded {
                reason: ScanEndReason::Failed,
                discovered: session.len(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::simulated::SimulatedRadio;

    fn scanner(named_only: bool) -> (Scanner, Arc<SimulatedRadio>, Arc<EventBus>) {
        let (radio, _events) = SimulatedRadio::new();
        let bus = Arc::new(EventBus::new(32));
        let options = ScannerOptions {
            named_only,
            ..Default::default()
        };
        (Scanner::new(radio.clone(), bus.clone(), options), radio, bus)
    }

    #[test]
    fn test_session_upsert_is_idempotent() {
        let mut session = ScanSession::new(Duration::from_secs(10));
        session.upsert(Peripheral::new("AA:BB").with_rssi(-80));
        session.upsert(Peripheral::new("AA:BB").with_rssi(-60));
        session.upsert(Peripheral::new("CC:DD"));

        assert_eq!(session.len(), 2);
        assert_eq!(session.get("AA:BB").unwrap().rssi, Some(-60));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (scanner, radio, _bus) = scanner(false);
        scanner.start(Duration::from_secs(10)).await.unwrap();

        assert_eq!(
            scanner.start(Duration::from_secs(10)).await,
            Err(BleError::AlreadyScanning)
        );
        assert!(radio.is_scanning());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (scanner, _radio, bus) = scanner(false);
        let rx = bus.subscribe();

        assert!(scanner.stop().await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_publishes_scan_ended_once() {
        let (scanner, radio, bus) = scanner(false);
        let rx = bus.subscribe();

        scanner.start(Duration::from_secs(10)).await.unwrap();
        scanner.on_discovered(Peripheral::new("AA:BB"));
        scanner.stop().await.unwrap();
        scanner.stop().await.unwrap();

        assert!(!radio.is_scanning());
        assert!(matches!(
            rx.try_recv().unwrap(),
            DeviceEvent::PeripheralDiscovered(_)
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::ScanEnded {
                reason: ScanEndReason::Stopped,
                discovered: 1
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_discovery_outside_session_ignored() {
        let (scanner, _radio, bus) = scanner(false);
        let rx = bus.subscribe();

        scanner.on_discovered(Peripheral::new("AA:BB"));
        assert!(scanner.peripherals().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_named_only_filter() {
        let (scanner, _radio, _bus) = scanner(true);
        scanner.start(Duration::from_secs(10)).await.unwrap();

        scanner.on_discovered(Peripheral::new("AA:BB"));
        scanner.on_discovered(Peripheral::new("CC:DD").with_name("P2PSRV1"));
        scanner.on_discovered(Peripheral::new("CC:DD"));

        let found = scanner.peripherals();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.as_deref(), Some("P2PSRV1"));
    }

    #[tokio::test]
    async fn test_late_name_admits_peripheral() {
        let (scanner, _radio, bus) = scanner(true);
        let rx = bus.subscribe();
        scanner.start(Duration::from_secs(10)).await.unwrap();

        scanner.on_discovered(Peripheral::new("AA:BB").with_rssi(-70));
        assert!(scanner.peripheral("AA:BB").is_none());

        scanner.on_discovered(Peripheral::new("AA:BB").with_name("P2PSRV1").with_rssi(-65));
        let stored = scanner.peripheral("AA:BB").unwrap();
        assert_eq!(stored.name.as_deref(), Some("P2PSRV1"));
        assert_eq!(stored.rssi, Some(-65));
        assert!(matches!(
            rx.try_recv().unwrap(),
            DeviceEvent::PeripheralDiscovered(_)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_radio_unavailable_refuses_start() {
        let (scanner, radio, _bus) = scanner(false);
        radio.set_enabled(false);

        assert_eq!(
            scanner.start(Duration::from_secs(10)).await,
            Err(BleError::RadioUnavailable)
        );
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_failure_ends_session() {
        let (scanner, _radio, bus) = scanner(false);
        let rx = bus.subscribe();
        scanner.start(Duration::from_secs(10)).await.unwrap();

        scanner.on_scan_failed(2);

        assert!(!scanner.is_scanning());
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::ErrorOccurred(BleError::ScanFailed(2))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::ScanEnded {
                reason: ScanEndReason::Failed,
                discovered: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_start_ends_session() {
        let (scanner, radio, bus) = scanner(false);
        let rx = bus.subscribe();
        radio.set_scan_start_delay(Duration::from_secs(1));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), scanner.start(Duration::from_secs(10)))
                .await;
        assert!(cancelled.is_err());
        assert!(!scanner.is_scanning());
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::ScanEnded {
                reason: ScanEndReason::Stopped,
                discovered: 0
            }
        );
        assert!(rx.try_recv().is_err());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!radio.is_scanning());

        radio.set_scan_start_delay(Duration::ZERO);
        scanner.start(Duration::from_secs(10)).await.unwrap();
        assert!(scanner.is_scanning());
        assert!(radio.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_start_stops_radio() {
        let (scanner, radio, bus) = scanner(false);
        let rx = bus.subscribe();
        radio.set_scan_start_delay(Duration::from_secs(1));

        let starting = tokio::spawn({
            let scanner = scanner.clone();
            async move { scanner.start(Duration::from_secs(10)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        scanner.stop().await.unwrap();

        assert_eq!(starting.await.unwrap(), Ok(()));
        assert!(!scanner.is_scanning());
        assert!(!radio.is_scanning());
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::ScanEnded {
                reason: ScanEndReason::Stopped,
                discovered: 0
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_is_published() {
        let (scanner, radio, bus) = scanner(false);
        let rx = bus.subscribe();
        radio.set_scan_start_delay(Duration::from_secs(30));

        assert_eq!(
            scanner.start(Duration::from_secs(10)).await,
            Err(BleError::Timeout)
        );
        assert!(!scanner.is_scanning());
        assert!(!radio.is_scanning());
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::ErrorOccurred(BleError::Timeout)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_session_keeps_window() {
        let before = Local::now();
        let session = ScanSession::new(Duration::from_secs(10));

        assert_eq!(session.duration(), Duration::from_secs(10));
        assert!(session.started_at() >= before);
        assert!(session.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle() {
        let (scanner, _radio, _bus) = scanner(false);

        assert!(scanner.toggle(Duration::from_secs(50)).await.unwrap());
        assert!(scanner.is_scanning());
        assert!(!scanner.toggle(Duration::from_secs(50)).await.unwrap());
        assert!(!scanner.is_scanning());
    }
}

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

//! SmartDevice Desktop Application

use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smartdevice_desktop::bluetooth::{BluetoothManager, BluezRadio, Counter};
use smartdevice_desktop::config::Config;
use smartdevice_desktop::events::EventProcessor;
use smartdevice_desktop::state::AppState;
use smartdevice_desktop::ui::{self, TrayAction, TrayHandle};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smartdevice_desktop=info".parse().unwrap()),
        )
        .init();

    info!(
        "Starting SmartDevice Desktop v{}...",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded from {}", Config::path().display());

    // Open the radio
    let (radio, radio_events) = BluezRadio::open(config.bluetooth.adapter.as_deref()).await?;
    let manager = Arc::new(BluetoothManager::new(
        radio,
        radio_events,
        config.manager_options(),
    ));
    if let Err(e) = manager.gateway().ensure_ready().await {
        warn!("Bluetooth not ready yet: {}", e);
    }

    // Create application state
    let state = AppState::new();

    // Start system tray
    let (mut action_rx, tray) = ui::run_tray(state.clone())?;

    // Fold device events into the state
    let events = manager.subscribe();
    let processor = EventProcessor::new(state.clone(), config.profile());
    let tray_events = tray.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            processor.process_event(event);
            tray_events.update(|_| {});
        }
        debug!("Event stream ended");
    });

    if config.scan.auto_start {
        toggle_scan(&manager, &state).await;
    }

    info!("Ready. System tray active.");

    // Handle tray actions
    loop {
        tokio::select! {
            Some(action) = action_rx.recv() => {
                if action == TrayAction::Quit {
                    info!("Quit requested");
                    break;
                }
                tokio::spawn(handle_action(
                    manager.clone(),
                    state.clone(),
                    tray.clone(),
                    action,
                ));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = manager.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }
    if let Err(e) = manager.disconnect().await {
        warn!("Failed to disconnect: {}", e);
    }
    tray.shutdown();

    info!("SmartDevice Desktop stopped");
    Ok(())
}

async fn toggle_scan(manager: &BluetoothManager, state: &AppState) {
    if manager.is_scanning() {
        if let Err(e) = manager.stop_scan().await {
            error!("Failed to stop scan: {}", e);
            state.set_error(e);
        }
        return;
    }

    // Cleared before starting so early sightings are kept.
    let previous = state.begin_scan();
    if let Err(e) = manager.start_scan().await {
        error!("Failed to start scan: {}", e);
        state.abort_scan(previous);
        state.set_error(e);
    }
}

/// Keep a counter subscription alive until the link goes down.
async fn follow_counter(manager: Arc<BluetoothManager>, counter: Counter) {
    match manager.watch_counter(counter).await {
        Ok(mut updates) => {
            while let Some(value) = updates.next().await {
                debug!("{} notification: {:?}", counter.label(), value);
            }
            debug!("{} notifications ended", counter.label());
        }
        Err(e) => warn!("Cannot watch {}: {}", counter.label(), e),
    }
}

async fn read_counters(manager: &BluetoothManager, state: &AppState) {
    for counter in Counter::ALL {
        match manager.read_counter(counter).await {
            Ok(count) => state.set_counter(counter, count),
            Err(e) => {
                warn!("Failed to read {}: {}", counter.label(), e);
                state.set_error(e);
            }
        }
    }
}

async fn handle_action(
    manager: Arc<BluetoothManager>,
    state: Arc<AppState>,
    tray: TrayHandle,
    action: TrayAction,
) {
    match action {
        TrayAction::ToggleScan => toggle_scan(&manager, &state).await,
        TrayAction::Connect(id) => {
            let result = match state.find_discovered(&id) {
                Some(peripheral) => manager.connect(peripheral).await,
                None => manager.connect_to(&id).await,
            };
            match result {
                Ok(()) => {
                    for counter in Counter::ALL {
                        tokio::spawn(follow_counter(manager.clone(), counter));
                    }
                    read_counters(&manager, &state).await;
                }
                Err(e) => error!("Failed to connect to {}: {}", id, e),
            }
        }
        TrayAction::Disconnect => {
            if let Err(e) = manager.disconnect().await {
                error!("Failed to disconnect: {}", e);
            }
        }
        TrayAction::Dismiss => manager.acknowledge_failure(),
        TrayAction::SetLed(command) => match manager.set_led(command).await {
            Ok(()) => state.set_led(command),
            Err(e) => {
                error!("Failed to set LEDs: {}", e);
                state.set_error(e);
            }
        },
        TrayAction::ReadCounters => read_counters(&manager, &state).await,
        TrayAction::Quit => {}
    }

    // Refresh the menu
    tray.update(|_| {});
}


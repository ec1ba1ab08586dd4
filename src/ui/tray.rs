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

//! System tray implementation using ksni.

use anyhow::Result;
use ksni::{self, menu::StandardItem, menu::SubMenu, Handle, MenuItem, Tray, TrayService};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::bluetooth::{ConnectionState, Counter, LedCommand};
use crate::state::{icon_name, AppState};

/// Actions that can be triggered from the tray menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrayAction {
    ToggleScan,
    /// Connect to a discovered peripheral by address.
    Connect(String),
    Disconnect,
    /// Clear a failed connection.
    Dismiss,
    SetLed(LedCommand),
    ReadCounters,
    Quit,
}

pub type TrayHandle = Handle<SmartDeviceTray>;

/// System tray icon and menu.
pub struct SmartDeviceTray {
    state: Arc<AppState>,
    action_tx: mpsc::UnboundedSender<TrayAction>,
}

impl SmartDeviceTray {
    pub fn new(state: Arc<AppState>, action_tx: mpsc::UnboundedSender<TrayAction>) -> Self {
        Self { state, action_tx }
    }

    fn action(label: impl Into<String>, action: TrayAction) -> MenuItem<Self> {
        MenuItem::Standard(StandardItem {
            label: label.into(),
            activate: Box::new(move |tray: &mut Self| {
                let _ = tray.action_tx.send(action.clone());
            }),
            ..Default::default()
        })
    }

    fn disabled(label: impl Into<String>) -> MenuItem<Self> {
        MenuItem::Standard(StandardItem {
            label: label.into(),
            enabled: false,
            ..Default::default()
        })
    }

    fn device_menu(&self) -> MenuItem<Self> {
        let discovered = self.state.get_discovered();
        let submenu = if discovered.is_empty() {
            vec![Self::disabled(self.state.scan_status_text())]
        } else {
            discovered
                .iter()
                .map(|p| {
                    let label = match p.rssi {
                        Some(rssi) => format!("{} ({} dBm)", p.display_name(), rssi),
                        None => p.display_name().to_string(),
                    };
                    Self::action(label, TrayAction::Connect(p.id.clone()))
                })
                .collect()
        };

        MenuItem::SubMenu(SubMenu {
            label: format!("Devices ({})", discovered.len()),
            enabled: self.state.get_status() == ConnectionState::Disconnected,
            submenu,
            ..Default::default()
        })
    }
}

/// Header line describing the connection.
pub fn status_label(state: &AppState) -> String {
    match state.get_status() {
        ConnectionState::Connected => {
            let device = state
                .get_device_name()
                .unwrap_or_else(|| "Unknown".to_string());
            format!("● Connected: {}", device)
        }
        ConnectionState::Disconnected => "○ Disconnected".to_string(),
        ConnectionState::Connecting => "◐ Connecting...".to_string(),
        ConnectionState::Disconnecting => "◐ Disconnecting...".to_string(),
        ConnectionState::Failed => "✕ Connection failed".to_string(),
    }
}

/// Counter line, "?" until a value is known.
pub fn counter_label(state: &AppState, counter: Counter) -> String {
    match state.get_counter(counter) {
        Some(count) => format!("{} clicks: {}", counter.label(), count),
        None => format!("{} clicks: ?", counter.label()),
    }
}

impl Tray for SmartDeviceTray {
    fn icon_name(&self) -> String {
        icon_name(self.state.get_status()).to_string()
    }

    fn title(&self) -> String {
        "SmartDevice".to_string()
    }

    fn tool_tip(&self) -> ksni::ToolTip {
        let mut description = match self.state.get_status() {
            ConnectionState::Connected => {
                let device = self.state.get_device_name().unwrap_or_default();
                format!("Connected to {}", device)
            }
            ConnectionState::Disconnected => self.state.scan_status_text().to_string(),
            status => status.as_str().to_string(),
        };
        if let Some(e) = self.state.get_last_error() {
            description.push_str(&format!("\nLast error: {}", e));
        }

        ksni::ToolTip {
            icon_name: String::new(),
            icon_pixmap: Vec::new(),
            title: "SmartDevice".to_string(),
            description,
        }
    }

    fn menu(&self) -> Vec<MenuItem<Self>> {
        let status = self.state.get_status();
        let mut items = vec![Self::disabled(status_label(&self.state)), MenuItem::Separator];

        // Scanning
        let scan_label = if self.state.is_scanning() {
            "Stop Scan"
        } else {
            "Scan for Devices"
        };
        items.push(Self::action(scan_label, TrayAction::ToggleScan));
        items.push(self.device_menu());
        items.push(MenuItem::Separator);

        match status {
            ConnectionState::Connected => {
                let led_on = self.state.get_led().is_some_and(|led| led.is_on());
                if led_on {
                    items.push(Self::action("Turn OFF LEDs", TrayAction::SetLed(LedCommand::Off)));
                } else {
                    items.push(Self::action("Turn ON LEDs", TrayAction::SetLed(LedCommand::Led1)));
                }
                for counter in Counter::ALL {
                    items.push(Self::disabled(counter_label(&self.state, counter)));
                }
                items.push(Self::action("Refresh Counters", TrayAction::ReadCounters));
                items.push(Self::action("Disconnect", TrayAction::Disconnect));
                items.push(MenuItem::Separator);
            }
            ConnectionState::Connecting => {
                items.push(Self::action("Cancel", TrayAction::Disconnect));
                items.push(MenuItem::Separator);
            }
            ConnectionState::Failed => {
                items.push(Self::action("Dismiss", TrayAction::Dismiss));
                items.push(MenuItem::Separator);
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
        }

        items.push(Self::action("Quit", TrayAction::Quit));
        items
    }

    fn id(&self) -> String {
        "smartdevice".to_string()
    }

    fn category(&self) -> ksni::Category {
        ksni::Category::Hardware
    }
}

/// Run the system tray service.
pub fn run_tray(state: Arc<AppState>) -> Result<(mpsc::UnboundedReceiver<TrayAction>, TrayHandle)> {
    let (action_tx, action_rx) = mpsc::unbounded_channel();

    let tray = SmartDeviceTray::new(state, action_tx);
    let service = TrayService::new(tray);
    let handle = service.handle();

    // Spawn the tray service
    std::thread::spawn(move || {
        let _ = service.run();
    });

    info!("System tray started");

    Ok((action_rx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::Peripheral;

    #[test]
    fn test_status_label() {
        let state = AppState::new();
        assert_eq!(status_label(&state), "○ Disconnected");

        state.set_connection(
            ConnectionState::Connected,
            Some(Peripheral::new("AA:BB").with_name("P2PSRV1")),
        );
        assert_eq!(status_label(&state), "● Connected: P2PSRV1");
    }

    #[test]
    fn test_counter_label() {
        let state = AppState::new();
        assert_eq!(counter_label(&state, Counter::MainButton), "Main button clicks: ?");
        state.set_counter(Counter::MainButton, 5);
        assert_eq!(counter_label(&state, Counter::MainButton), "Main button clicks: 5");
    }

    #[test]
    fn test_menu_actions_reach_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tray = SmartDeviceTray::new(AppState::new(), tx);

        let MenuItem::Standard(item) = SmartDeviceTray::action("Quit", TrayAction::Quit) else {
            panic!("expected a standard item");
        };
        (item.activate)(&mut tray);
        assert_eq!(rx.try_recv().unwrap(), TrayAction::Quit);
    }
}

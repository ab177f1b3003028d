use serde::{Deserialize, Serialize};

use crate::types::{Line, LineState, SwitchConfigEntry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub debounce_ms: u64,
    pub stagger_on_config: bool,
    pub stagger_ms: u64,
    pub relay_active_low: bool,
    pub announce_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub command_queue_capacity: usize,
    pub max_switches: usize,
    pub reserved_lines_start: Line,
    pub reserved_lines_end: Line,
    /// Highest GPIO number the board exposes.
    pub max_line: Line,
    /// Output owned by the status LED; never assignable to a switch.
    pub status_led_line: Option<Line>,
    pub settings_save_debounce_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            stagger_on_config: true,
            stagger_ms: 80,
            relay_active_low: false,
            announce_interval_ms: 500,
            heartbeat_interval_ms: 30_000,
            command_queue_capacity: 16,
            max_switches: 8,
            reserved_lines_start: 6,
            reserved_lines_end: 11,
            max_line: 39,
            status_led_line: Some(2),
            settings_save_debounce_ms: 2_000,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.debounce_ms = self.debounce_ms.clamp(5, 2_000);
        self.stagger_ms = self.stagger_ms.min(1_000);
        self.announce_interval_ms = self.announce_interval_ms.clamp(50, 60_000);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.clamp(1_000, 600_000);
        self.command_queue_capacity = self.command_queue_capacity.clamp(1, 64);
        self.max_switches = self.max_switches.clamp(1, 32);
        self.settings_save_debounce_ms = self.settings_save_debounce_ms.max(250);
        if self.reserved_lines_start > self.reserved_lines_end {
            std::mem::swap(&mut self.reserved_lines_start, &mut self.reserved_lines_end);
        }
    }

    pub fn is_reserved(&self, line: Line) -> bool {
        (self.reserved_lines_start..=self.reserved_lines_end).contains(&line)
            || self.status_led_line == Some(line)
    }

    /// Inter-write pause used when applying a configuration diff.
    pub fn config_stagger_ms(&self) -> u64 {
        if self.stagger_on_config {
            self.stagger_ms
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub mac: String,
    pub name: String,
    pub firmware: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            mac: "00:00:00:00:00:00".to_string(),
            name: "Relay Box".to_string(),
            firmware: "v1.2.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub ws_host: String,
    pub ws_port: u16,
    pub ws_path: String,
    pub ws_secure: bool,
    pub reconnect_interval_ms: u64,
    pub device_secret: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            ws_host: "127.0.0.1".to_string(),
            ws_port: 3001,
            ws_path: "/esp32-ws".to_string(),
            ws_secure: false,
            reconnect_interval_ms: 3_000,
            device_secret: String::new(),
        }
    }
}

impl NetworkConfig {
    pub fn ws_url(&self) -> String {
        let scheme = if self.ws_secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.ws_host, self.ws_port, self.ws_path)
    }

    pub fn secret(&self) -> Option<&str> {
        if self.device_secret.is_empty() {
            None
        } else {
            Some(self.device_secret.as_str())
        }
    }
}

/// Last delivered switch configuration and the last level written to each line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedSwitches {
    pub entries: Vec<SwitchConfigEntry>,
    pub states: Vec<LineState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub device: DeviceIdentity,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub switches: PersistedSwitches,
}

use serde::{Deserialize, Serialize};

/// GPIO number of a relay output or manual input.
pub type Line = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualMode {
    #[default]
    Maintained,
    Momentary,
}

impl ManualMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Maintained => "maintained",
            Self::Momentary => "momentary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManualPolarity {
    #[default]
    ActiveLow,
    ActiveHigh,
}

impl ManualPolarity {
    pub fn from_active_low(active_low: bool) -> Self {
        if active_low {
            Self::ActiveLow
        } else {
            Self::ActiveHigh
        }
    }

    /// Maps a raw electrical level to the logical "pressed / closed" value.
    pub fn is_active(self, raw_high: bool) -> bool {
        match self {
            Self::ActiveLow => !raw_high,
            Self::ActiveHigh => raw_high,
        }
    }
}

/// One entry of a configuration payload, as delivered by the backend.
///
/// Line numbers stay signed here; resolving them into [`Line`] values is the
/// registry's job so that a single bad entry can be rejected on its own.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SwitchConfigEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<i64>,
    /// Older payloads name the relay line `gpio`.
    #[serde(default, skip_serializing)]
    pub gpio: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "manualMode", default, skip_serializing_if = "Option::is_none")]
    pub manual_mode: Option<ManualMode>,
    #[serde(
        rename = "manualActiveLow",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub manual_active_low: Option<bool>,
    #[serde(rename = "defaultState", default, skip_serializing_if = "Option::is_none")]
    pub default_state: Option<bool>,
    /// Why this entry failed to decode; the registry rejects it by index.
    #[serde(skip)]
    pub malformed: Option<String>,
}

impl SwitchConfigEntry {
    /// Decodes one payload entry. A failure yields a malformed placeholder
    /// instead of failing the whole payload.
    pub fn from_value(value: serde_json::Value) -> Self {
        match serde_json::from_value::<Self>(value) {
            Ok(mut entry) => {
                if entry.relay.is_none() {
                    entry.relay = entry.gpio.take();
                }
                entry
            }
            Err(err) => Self::malformed(err.to_string()),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            malformed: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn relay_value(&self) -> Option<i64> {
        self.relay.or(self.gpio)
    }

    pub fn relay(line: i64) -> Self {
        Self {
            relay: Some(line),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_manual(mut self, line: i64, mode: ManualMode, active_low: bool) -> Self {
        self.manual = Some(line);
        self.manual_mode = Some(mode);
        self.manual_active_low = Some(active_low);
        self
    }

    pub fn with_default_state(mut self, on: bool) -> Self {
        self.default_state = Some(on);
        self
    }
}

/// Last-known output level of a line, persisted across reboots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineState {
    pub line: Line,
    pub on: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchView {
    pub gpio: Line,
    pub name: String,
    pub state: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual: Option<Line>,
    #[serde(rename = "manualMode")]
    pub manual_mode: &'static str,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn polarity_maps_raw_levels() {
        assert!(ManualPolarity::ActiveLow.is_active(false));
        assert!(!ManualPolarity::ActiveLow.is_active(true));
        assert!(ManualPolarity::ActiveHigh.is_active(true));
        assert!(!ManualPolarity::ActiveHigh.is_active(false));
    }

    #[test]
    fn config_entry_accepts_gpio_alias_and_defaults() {
        let entry = SwitchConfigEntry::from_value(
            json!({"gpio": 4, "name": "Fan1", "manualMode": "momentary"}),
        );

        assert_eq!(entry.malformed, None);
        assert_eq!(entry.relay, Some(4));
        assert_eq!(entry.manual, None);
        assert_eq!(entry.manual_mode, Some(ManualMode::Momentary));
        assert_eq!(entry.manual_active_low, None);
        assert_eq!(entry.default_state, None);
    }

    #[test]
    fn config_entry_with_relay_and_gpio_prefers_relay() {
        let entry = SwitchConfigEntry::from_value(json!({"relay": 4, "gpio": 5}));

        assert_eq!(entry.malformed, None);
        assert_eq!(entry.relay_value(), Some(4));
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"relay": 4})
        );
    }

    #[test]
    fn undecodable_entry_becomes_malformed() {
        for value in [
            json!({"relay": 4, "manualMode": "toggle"}),
            json!({"relay": "13"}),
            json!("Fan1"),
        ] {
            let entry = SwitchConfigEntry::from_value(value);
            assert!(entry.malformed.is_some());
            assert_eq!(entry.relay_value(), None);
        }
    }
}

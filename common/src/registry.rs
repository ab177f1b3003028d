use std::collections::{HashMap, HashSet};

use log::{info, warn};
use thiserror::Error;

use crate::{
    config::ControllerConfig,
    types::{Line, LineState, ManualMode, ManualPolarity, SwitchConfigEntry, SwitchView},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("entry {index}: malformed ({reason})")]
    Malformed { index: usize, reason: String },
    #[error("entry {index}: no relay line")]
    MissingRelayLine { index: usize },
    #[error("entry {index}: line {value} is out of range")]
    LineOutOfRange { index: usize, value: i64 },
    #[error("entry {index}: line {line} is reserved")]
    ReservedLine { index: usize, line: Line },
    #[error("entry {index}: relay line {line} already assigned")]
    DuplicateRelayLine { index: usize, line: Line },
    #[error("entry {index}: manual line {line} is also the relay line")]
    ManualIsRelay { index: usize, line: Line },
    #[error("entry {index}: line {line} is already wired to another switch")]
    LineInUse { index: usize, line: Line },
    #[error("entry {index}: more than {max} switches configured")]
    TooManySwitches { index: usize, max: usize },
}

/// Debounce bookkeeping for one manual input. `None` fields mean "not primed yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebounceState {
    pub last_raw_high: Option<bool>,
    pub last_change_ms: u64,
    pub stable_high: Option<bool>,
    pub stable_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Switch {
    pub relay_line: Line,
    pub manual_line: Option<Line>,
    pub name: String,
    pub logical_state: bool,
    pub polarity: ManualPolarity,
    pub mode: ManualMode,
    pub debounce: DebounceState,
}

impl Switch {
    pub fn view(&self) -> SwitchView {
        SwitchView {
            gpio: self.relay_line,
            name: self.name.clone(),
            state: self.logical_state,
            manual: self.manual_line,
            manual_mode: self.mode.as_str(),
        }
    }

    pub fn write(&self) -> RelayWrite {
        RelayWrite {
            line: self.relay_line,
            on: self.logical_state,
        }
    }

    fn same_manual_wiring(&self, other: &Switch) -> bool {
        self.manual_line == other.manual_line && self.polarity == other.polarity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayWrite {
    pub line: Line,
    pub on: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rebuild {
    /// Lines whose level must be driven, in configuration order.
    pub writes: Vec<RelayWrite>,
    pub errors: Vec<ConfigError>,
    /// Lines dropped from the configuration; their outputs are left untouched.
    pub released: Vec<Line>,
}

#[derive(Debug, Clone, Default)]
pub struct SwitchRegistry {
    switches: Vec<Switch>,
}

impl SwitchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }

    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    pub fn switches_mut(&mut self) -> &mut [Switch] {
        &mut self.switches
    }

    pub fn get(&self, line: Line) -> Option<&Switch> {
        self.switches.iter().find(|switch| switch.relay_line == line)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Switch> {
        self.switches.iter().find(|switch| switch.name == name)
    }

    /// Name match wins over line match when both are supplied.
    pub fn resolve_target(&self, name: Option<&str>, line: Option<Line>) -> Option<Line> {
        name.and_then(|name| self.find_by_name(name))
            .or_else(|| line.and_then(|line| self.get(line)))
            .map(|switch| switch.relay_line)
    }

    pub fn set_state(&mut self, line: Line, on: bool) -> Option<RelayWrite> {
        let switch = self
            .switches
            .iter_mut()
            .find(|switch| switch.relay_line == line)?;
        switch.logical_state = on;
        Some(switch.write())
    }

    pub fn snapshot(&self) -> Vec<SwitchView> {
        self.switches.iter().map(Switch::view).collect()
    }

    pub fn line_states(&self) -> Vec<LineState> {
        self.switches
            .iter()
            .map(|switch| LineState {
                line: switch.relay_line,
                on: switch.logical_state,
            })
            .collect()
    }

    /// Replaces the registry with `entries`, carrying state forward for known relay lines.
    pub fn rebuild(&mut self, entries: &[SwitchConfigEntry], config: &ControllerConfig) -> Rebuild {
        self.rebuild_seeded(entries, config, &HashMap::new())
    }

    /// Boot-time rebuild: new lines are seeded from the last persisted level before the entry hint.
    pub fn restore(
        &mut self,
        entries: &[SwitchConfigEntry],
        states: &[LineState],
        config: &ControllerConfig,
    ) -> Rebuild {
        let seeds = states
            .iter()
            .map(|state| (state.line, state.on))
            .collect::<HashMap<_, _>>();
        self.rebuild_seeded(entries, config, &seeds)
    }

    fn rebuild_seeded(
        &mut self,
        entries: &[SwitchConfigEntry],
        config: &ControllerConfig,
        seeds: &HashMap<Line, bool>,
    ) -> Rebuild {
        let mut previous = std::mem::take(&mut self.switches)
            .into_iter()
            .map(|switch| (switch.relay_line, switch))
            .collect::<HashMap<_, _>>();

        let mut rebuild = Rebuild::default();
        let mut claimed = HashSet::new();
        let mut manual_claimed = HashSet::new();

        for (index, entry) in entries.iter().enumerate() {
            if self.switches.len() >= config.max_switches {
                rebuild.errors.push(ConfigError::TooManySwitches {
                    index,
                    max: config.max_switches,
                });
                continue;
            }

            let resolved = resolve_entry(index, entry, config, &claimed, &manual_claimed);
            let mut switch = match resolved {
                Ok(switch) => switch,
                Err(err) => {
                    rebuild.errors.push(err);
                    continue;
                }
            };
            claimed.insert(switch.relay_line);
            manual_claimed.extend(switch.manual_line);

            match previous.remove(&switch.relay_line) {
                Some(prior) => {
                    switch.logical_state = prior.logical_state;
                    if switch.same_manual_wiring(&prior) {
                        switch.debounce = prior.debounce;
                    }
                }
                None => {
                    if let Some(seed) = seeds.get(&switch.relay_line) {
                        switch.logical_state = *seed;
                    }
                    rebuild.writes.push(switch.write());
                }
            }

            self.switches.push(switch);
        }

        rebuild.released = previous.into_keys().collect();
        rebuild.released.sort_unstable();

        for err in &rebuild.errors {
            warn!("switch configuration error: {err}");
        }
        if !rebuild.released.is_empty() {
            info!(
                "relay lines removed from configuration, left at last level: {:?}",
                rebuild.released
            );
        }
        info!(
            "switch registry rebuilt: {} switches, {} lines to drive, {} entries rejected",
            self.switches.len(),
            rebuild.writes.len(),
            rebuild.errors.len()
        );

        rebuild
    }
}

fn resolve_line(index: usize, value: i64, config: &ControllerConfig) -> Result<Line, ConfigError> {
    let line = Line::try_from(value)
        .ok()
        .filter(|line| *line <= config.max_line)
        .ok_or(ConfigError::LineOutOfRange { index, value })?;
    if config.is_reserved(line) {
        return Err(ConfigError::ReservedLine { index, line });
    }
    Ok(line)
}

fn resolve_entry(
    index: usize,
    entry: &SwitchConfigEntry,
    config: &ControllerConfig,
    claimed: &HashSet<Line>,
    manual_claimed: &HashSet<Line>,
) -> Result<Switch, ConfigError> {
    if let Some(reason) = &entry.malformed {
        return Err(ConfigError::Malformed {
            index,
            reason: reason.clone(),
        });
    }
    let relay = entry
        .relay_value()
        .ok_or(ConfigError::MissingRelayLine { index })?;
    let relay_line = resolve_line(index, relay, config)?;
    if claimed.contains(&relay_line) {
        return Err(ConfigError::DuplicateRelayLine {
            index,
            line: relay_line,
        });
    }

    if manual_claimed.contains(&relay_line) {
        return Err(ConfigError::LineInUse {
            index,
            line: relay_line,
        });
    }

    let manual_line = entry
        .manual
        .map(|value| resolve_line(index, value, config))
        .transpose()?;
    if manual_line == Some(relay_line) {
        return Err(ConfigError::ManualIsRelay {
            index,
            line: relay_line,
        });
    }
    if let Some(line) = manual_line.filter(|line| claimed.contains(line)) {
        return Err(ConfigError::LineInUse { index, line });
    }

    let name = entry
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("gpio{relay_line}"));

    Ok(Switch {
        relay_line,
        manual_line,
        name,
        logical_state: entry.default_state.unwrap_or(false),
        polarity: ManualPolarity::from_active_low(entry.manual_active_low.unwrap_or(true)),
        mode: entry.manual_mode.unwrap_or_default(),
        debounce: DebounceState::default(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fan_and_light() -> Vec<SwitchConfigEntry> {
        vec![
            SwitchConfigEntry::relay(4)
                .named("Fan1")
                .with_manual(25, ManualMode::Maintained, true),
            SwitchConfigEntry::relay(5)
                .named("Light1")
                .with_default_state(true),
        ]
    }

    #[test]
    fn first_build_drives_every_line_with_its_hint() {
        let mut registry = SwitchRegistry::new();
        let rebuild = registry.rebuild(&fan_and_light(), &ControllerConfig::default());

        assert_eq!(
            rebuild.writes,
            vec![
                RelayWrite { line: 4, on: false },
                RelayWrite { line: 5, on: true },
            ]
        );
        assert!(rebuild.errors.is_empty());
        assert_eq!(registry.get(25), None);
        assert_eq!(registry.get(4).unwrap().manual_line, Some(25));
    }

    #[test]
    fn rebuild_preserves_state_for_unchanged_relay_lines() {
        let config = ControllerConfig::default();
        let mut registry = SwitchRegistry::new();
        registry.rebuild(&fan_and_light(), &config);
        registry.set_state(4, true);
        registry.set_state(5, false);

        // Hints in the new payload must not override what the hardware already does.
        let entries = vec![
            SwitchConfigEntry::relay(4)
                .named("Fan (renamed)")
                .with_default_state(false),
            SwitchConfigEntry::relay(5).with_default_state(true),
            SwitchConfigEntry::relay(13).named("Heater"),
        ];
        let rebuild = registry.rebuild(&entries, &config);

        assert_eq!(rebuild.writes, vec![RelayWrite { line: 13, on: false }]);
        assert!(registry.get(4).unwrap().logical_state);
        assert!(!registry.get(5).unwrap().logical_state);
        assert_eq!(registry.get(4).unwrap().name, "Fan (renamed)");
    }

    #[test]
    fn omitted_lines_are_released_without_a_write() {
        let config = ControllerConfig::default();
        let mut registry = SwitchRegistry::new();
        registry.rebuild(&fan_and_light(), &config);
        registry.set_state(5, true);

        let rebuild = registry.rebuild(&[SwitchConfigEntry::relay(4)], &config);

        assert!(rebuild.writes.is_empty());
        assert_eq!(rebuild.released, vec![5]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bad_entries_are_skipped_without_aborting() {
        let mut registry = SwitchRegistry::new();
        let entries = vec![
            SwitchConfigEntry::default().named("no relay"),
            SwitchConfigEntry::relay(4),
            SwitchConfigEntry::relay(7),
            SwitchConfigEntry::relay(4).named("duplicate"),
            SwitchConfigEntry::relay(300),
            SwitchConfigEntry::relay(16).with_manual(16, ManualMode::Momentary, false),
            SwitchConfigEntry::relay(17),
        ];
        let rebuild = registry.rebuild(&entries, &ControllerConfig::default());

        assert_eq!(
            rebuild.errors,
            vec![
                ConfigError::MissingRelayLine { index: 0 },
                ConfigError::ReservedLine { index: 2, line: 7 },
                ConfigError::DuplicateRelayLine { index: 3, line: 4 },
                ConfigError::LineOutOfRange {
                    index: 4,
                    value: 300
                },
                ConfigError::ManualIsRelay { index: 5, line: 16 },
            ]
        );
        let lines = registry
            .switches()
            .iter()
            .map(|switch| switch.relay_line)
            .collect::<Vec<_>>();
        assert_eq!(lines, vec![4, 17]);
    }

    #[test]
    fn lines_beyond_the_board_and_the_status_led_are_rejected() {
        let mut registry = SwitchRegistry::new();
        let entries = vec![
            SwitchConfigEntry::relay(40),
            SwitchConfigEntry::relay(2),
            SwitchConfigEntry::relay(4).with_manual(39, ManualMode::Maintained, true),
            SwitchConfigEntry::relay(5).with_manual(200, ManualMode::Momentary, true),
        ];
        let rebuild = registry.rebuild(&entries, &ControllerConfig::default());

        assert_eq!(
            rebuild.errors,
            vec![
                ConfigError::LineOutOfRange {
                    index: 0,
                    value: 40
                },
                ConfigError::ReservedLine { index: 1, line: 2 },
                ConfigError::LineOutOfRange {
                    index: 3,
                    value: 200
                },
            ]
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(4).unwrap().manual_line, Some(39));
    }

    #[test]
    fn malformed_entry_is_rejected_by_its_index() {
        let mut registry = SwitchRegistry::new();
        let entries = vec![
            SwitchConfigEntry::relay(4).named("Fan1"),
            SwitchConfigEntry::malformed("unknown variant `toggle`"),
            SwitchConfigEntry::relay(5),
        ];
        let rebuild = registry.rebuild(&entries, &ControllerConfig::default());

        assert_eq!(
            rebuild.errors,
            vec![ConfigError::Malformed {
                index: 1,
                reason: "unknown variant `toggle`".to_string()
            }]
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn a_line_cannot_be_both_relay_and_manual_input() {
        let mut registry = SwitchRegistry::new();
        let entries = vec![
            SwitchConfigEntry::relay(4).with_manual(25, ManualMode::Maintained, true),
            SwitchConfigEntry::relay(25),
            SwitchConfigEntry::relay(5).with_manual(4, ManualMode::Momentary, true),
        ];
        let rebuild = registry.rebuild(&entries, &ControllerConfig::default());

        assert_eq!(
            rebuild.errors,
            vec![
                ConfigError::LineInUse { index: 1, line: 25 },
                ConfigError::LineInUse { index: 2, line: 4 },
            ]
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn switch_count_is_capped() {
        let config = ControllerConfig {
            max_switches: 2,
            ..ControllerConfig::default()
        };
        let mut registry = SwitchRegistry::new();
        let entries = [12, 13, 14]
            .into_iter()
            .map(SwitchConfigEntry::relay)
            .collect::<Vec<_>>();

        let rebuild = registry.rebuild(&entries, &config);

        assert_eq!(registry.len(), 2);
        assert_eq!(
            rebuild.errors,
            vec![ConfigError::TooManySwitches { index: 2, max: 2 }]
        );
    }

    #[test]
    fn debounce_bookkeeping_survives_only_unchanged_wiring() {
        let config = ControllerConfig::default();
        let mut registry = SwitchRegistry::new();
        registry.rebuild(&fan_and_light(), &config);
        registry.switches_mut()[0].debounce.stable_high = Some(true);

        registry.rebuild(&fan_and_light(), &config);
        assert_eq!(registry.get(4).unwrap().debounce.stable_high, Some(true));

        let rewired = vec![SwitchConfigEntry::relay(4).with_manual(26, ManualMode::Maintained, true)];
        registry.rebuild(&rewired, &config);
        assert_eq!(registry.get(4).unwrap().debounce, DebounceState::default());
    }

    #[test]
    fn restore_seeds_new_lines_from_persisted_levels() {
        let mut registry = SwitchRegistry::new();
        let states = [LineState { line: 4, on: true }];

        let rebuild = registry.restore(&fan_and_light(), &states, &ControllerConfig::default());

        assert_eq!(
            rebuild.writes,
            vec![
                RelayWrite { line: 4, on: true },
                RelayWrite { line: 5, on: true },
            ]
        );
    }

    #[test]
    fn name_match_takes_priority_over_line_match() {
        let mut registry = SwitchRegistry::new();
        registry.rebuild(&fan_and_light(), &ControllerConfig::default());

        assert_eq!(registry.resolve_target(Some("Light1"), Some(4)), Some(5));
        assert_eq!(registry.resolve_target(Some("missing"), Some(4)), Some(4));
        assert_eq!(registry.resolve_target(None, Some(5)), Some(5));
        assert_eq!(registry.resolve_target(Some("missing"), Some(99)), None);
        assert_eq!(registry.resolve_target(None, None), None);
    }

    #[test]
    fn unnamed_switches_get_a_line_based_name() {
        let mut registry = SwitchRegistry::new();
        registry.rebuild(
            &[SwitchConfigEntry::relay(18).named("   ")],
            &ControllerConfig::default(),
        );

        assert_eq!(registry.get(18).unwrap().name, "gpio18");
    }
}

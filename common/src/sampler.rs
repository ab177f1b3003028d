use crate::{
    registry::{DebounceState, Switch},
    types::ManualMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualEdge {
    /// Maintained input settled at a level that differs from the switch state.
    Set(bool),
    /// Momentary input was pressed.
    Toggle,
}

/// Two-stage debounce over raw manual-input levels.
#[derive(Debug, Clone, Copy)]
pub struct InputSampler {
    quiet_window_ms: u64,
}

impl InputSampler {
    pub fn new(quiet_window_ms: u64) -> Self {
        Self { quiet_window_ms }
    }

    /// Seeds bookkeeping from a level read at boot and treats it as already stable.
    pub fn prime(&self, switch: &mut Switch, raw_high: bool, now_ms: u64) {
        if switch.manual_line.is_none() {
            return;
        }
        switch.debounce = DebounceState {
            last_raw_high: Some(raw_high),
            last_change_ms: now_ms,
            stable_high: Some(raw_high),
            stable_active: Some(switch.polarity.is_active(raw_high)),
        };
    }

    pub fn sample(&self, switch: &mut Switch, raw_high: bool, now_ms: u64) -> Option<ManualEdge> {
        switch.manual_line?;

        let debounce = &mut switch.debounce;
        match debounce.last_raw_high {
            None => {
                debounce.last_raw_high = Some(raw_high);
                debounce.last_change_ms = now_ms;
                return None;
            }
            Some(last) if last != raw_high => {
                debounce.last_raw_high = Some(raw_high);
                debounce.last_change_ms = now_ms;
            }
            Some(_) => {}
        }

        if debounce.stable_high == Some(raw_high) {
            return None;
        }
        if now_ms.saturating_sub(debounce.last_change_ms) < self.quiet_window_ms {
            return None;
        }

        let previous_stable = debounce.stable_high.replace(raw_high);
        let active = switch.polarity.is_active(raw_high);
        let was_active = debounce.stable_active.replace(active);

        // The first settled level is a baseline, not a transition.
        previous_stable?;

        match switch.mode {
            ManualMode::Maintained => {
                (active != switch.logical_state).then_some(ManualEdge::Set(active))
            }
            ManualMode::Momentary => {
                (active && was_active == Some(false)).then_some(ManualEdge::Toggle)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualPolarity;

    const WINDOW: u64 = 50;

    fn switch(mode: ManualMode, polarity: ManualPolarity) -> Switch {
        Switch {
            relay_line: 4,
            manual_line: Some(25),
            name: "Fan1".to_string(),
            logical_state: false,
            polarity,
            mode,
            debounce: DebounceState::default(),
        }
    }

    fn hold(
        sampler: &InputSampler,
        switch: &mut Switch,
        raw_high: bool,
        from_ms: u64,
        until_ms: u64,
    ) -> Vec<ManualEdge> {
        (from_ms..=until_ms)
            .step_by(10)
            .filter_map(|now| sampler.sample(switch, raw_high, now))
            .collect()
    }

    #[test]
    fn maintained_input_reports_level_once_settled() {
        let sampler = InputSampler::new(WINDOW);
        let mut fan = switch(ManualMode::Maintained, ManualPolarity::ActiveLow);
        sampler.prime(&mut fan, true, 0);

        assert!(hold(&sampler, &mut fan, false, 100, 140).is_empty());
        assert_eq!(sampler.sample(&mut fan, false, 150), Some(ManualEdge::Set(true)));
        assert_eq!(sampler.sample(&mut fan, false, 500), None);
    }

    #[test]
    fn bounce_restarts_the_quiet_window() {
        let sampler = InputSampler::new(WINDOW);
        let mut fan = switch(ManualMode::Maintained, ManualPolarity::ActiveLow);
        sampler.prime(&mut fan, true, 0);

        assert_eq!(sampler.sample(&mut fan, false, 100), None);
        assert_eq!(sampler.sample(&mut fan, true, 120), None);
        assert_eq!(sampler.sample(&mut fan, false, 140), None);
        assert_eq!(sampler.sample(&mut fan, false, 185), None);
        assert_eq!(sampler.sample(&mut fan, false, 190), Some(ManualEdge::Set(true)));
    }

    #[test]
    fn chatter_returning_to_stable_level_is_ignored() {
        let sampler = InputSampler::new(WINDOW);
        let mut fan = switch(ManualMode::Maintained, ManualPolarity::ActiveLow);
        sampler.prime(&mut fan, true, 0);

        assert_eq!(sampler.sample(&mut fan, false, 100), None);
        assert!(hold(&sampler, &mut fan, true, 110, 400).is_empty());
    }

    #[test]
    fn maintained_level_matching_state_is_not_reported() {
        let sampler = InputSampler::new(WINDOW);
        let mut fan = switch(ManualMode::Maintained, ManualPolarity::ActiveHigh);
        sampler.prime(&mut fan, false, 0);
        fan.logical_state = true;

        // Remote already turned the line on; the wall switch now agrees.
        assert!(hold(&sampler, &mut fan, true, 10, 200).is_empty());
        assert_eq!(fan.debounce.stable_active, Some(true));
    }

    #[test]
    fn first_settled_level_is_a_baseline() {
        let sampler = InputSampler::new(WINDOW);
        let mut fan = switch(ManualMode::Maintained, ManualPolarity::ActiveLow);

        assert!(hold(&sampler, &mut fan, false, 0, 300).is_empty());
        assert_eq!(fan.debounce.stable_high, Some(false));
    }

    #[test]
    fn momentary_toggles_only_on_press() {
        let sampler = InputSampler::new(WINDOW);
        let mut button = switch(ManualMode::Momentary, ManualPolarity::ActiveLow);
        sampler.prime(&mut button, true, 0);

        assert_eq!(hold(&sampler, &mut button, false, 100, 400), vec![ManualEdge::Toggle]);
        assert!(hold(&sampler, &mut button, true, 410, 700).is_empty());
        assert_eq!(hold(&sampler, &mut button, false, 710, 900), vec![ManualEdge::Toggle]);
    }

    #[test]
    fn momentary_held_at_boot_does_not_toggle() {
        let sampler = InputSampler::new(WINDOW);
        let mut button = switch(ManualMode::Momentary, ManualPolarity::ActiveHigh);

        assert!(hold(&sampler, &mut button, true, 0, 500).is_empty());
        assert!(hold(&sampler, &mut button, false, 510, 700).is_empty());
        assert_eq!(hold(&sampler, &mut button, true, 710, 900), vec![ManualEdge::Toggle]);
    }

    #[test]
    fn switches_without_manual_line_never_sample() {
        let sampler = InputSampler::new(WINDOW);
        let mut relay_only = switch(ManualMode::Maintained, ManualPolarity::ActiveLow);
        relay_only.manual_line = None;

        assert!(hold(&sampler, &mut relay_only, false, 0, 500).is_empty());
        assert_eq!(relay_only.debounce, DebounceState::default());
    }
}

use std::collections::BTreeSet;

use log::{info, warn};
use thiserror::Error;

use crate::{registry::RelayWrite, types::Line};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("gpio{line} is not available: {reason}")]
    Unavailable { line: Line, reason: String },
    #[error("gpio{line} write failed: {reason}")]
    WriteFailed { line: Line, reason: String },
    #[error("gpio{line} read failed: {reason}")]
    ReadFailed { line: Line, reason: String },
}

/// Physical relay outputs. Only [`RelayDriver`] holds one.
pub trait RelayOutputs {
    fn write_level(&mut self, line: Line, high: bool) -> Result<(), HardwareError>;

    /// Blocks the writing path for `ms` milliseconds.
    fn pause_ms(&mut self, ms: u64);
}

/// Physical manual inputs; `true` is a high electrical level.
pub trait ManualInputs {
    fn read_level(&mut self, line: Line) -> Result<bool, HardwareError>;
}

pub struct RelayDriver<O> {
    outputs: O,
    active_low: bool,
    failed: BTreeSet<Line>,
}

impl<O: RelayOutputs> RelayDriver<O> {
    pub fn new(outputs: O, active_low: bool) -> Self {
        Self {
            outputs,
            active_low,
            failed: BTreeSet::new(),
        }
    }

    pub fn outputs(&self) -> &O {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut O {
        &mut self.outputs
    }

    /// Writes `writes` in order, pausing `stagger_ms` between consecutive writes.
    /// Returns the number of lines written successfully.
    pub fn apply(&mut self, writes: &[RelayWrite], stagger_ms: u64) -> usize {
        let mut written = 0;

        for (index, write) in writes.iter().enumerate() {
            if index > 0 && stagger_ms > 0 {
                self.outputs.pause_ms(stagger_ms);
            }

            let high = write.on != self.active_low;
            match self.outputs.write_level(write.line, high) {
                Ok(()) => {
                    self.failed.remove(&write.line);
                    written += 1;
                    info!(
                        "relay gpio{} -> {}",
                        write.line,
                        if write.on { "ON" } else { "OFF" }
                    );
                }
                Err(err) => {
                    self.failed.insert(write.line);
                    warn!("relay write failed: {err}");
                }
            }
        }

        written
    }

    pub fn has_failed_lines(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Lines whose last write failed, in ascending order. Clears the set.
    pub fn take_failed(&mut self) -> Vec<Line> {
        std::mem::take(&mut self.failed).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::RecordingOutputs;

    fn writes(lines: &[Line]) -> Vec<RelayWrite> {
        lines
            .iter()
            .map(|&line| RelayWrite { line, on: true })
            .collect()
    }

    #[test]
    fn stagger_pauses_between_writes_only() {
        let mut driver = RelayDriver::new(RecordingOutputs::default(), false);

        assert_eq!(driver.apply(&writes(&[4, 5, 13, 14]), 80), 4);

        let log = &driver.outputs().writes;
        let times = log.iter().map(|write| write.at_ms).collect::<Vec<_>>();
        assert_eq!(times, vec![0, 80, 160, 240]);
        assert_eq!(driver.outputs().now_ms, 240);
    }

    #[test]
    fn staggered_span_is_at_least_k_minus_one_intervals() {
        for k in 1..=6_u8 {
            let mut driver = RelayDriver::new(RecordingOutputs::default(), false);
            let lines = (12..12 + k).collect::<Vec<_>>();

            driver.apply(&writes(&lines), 50);

            let log = &driver.outputs().writes;
            let span = log.last().unwrap().at_ms - log.first().unwrap().at_ms;
            assert!(span >= u64::from(k - 1) * 50);
        }
    }

    #[test]
    fn unstaggered_apply_never_pauses() {
        let mut driver = RelayDriver::new(RecordingOutputs::default(), false);
        driver.apply(&writes(&[4, 5]), 0);

        assert_eq!(driver.outputs().now_ms, 0);
        assert_eq!(driver.outputs().pauses, 0);
    }

    #[test]
    fn active_low_boards_invert_the_electrical_level() {
        let mut driver = RelayDriver::new(RecordingOutputs::default(), true);
        driver.apply(
            &[
                RelayWrite { line: 4, on: true },
                RelayWrite { line: 5, on: false },
            ],
            0,
        );

        assert_eq!(driver.outputs().level(4), Some(false));
        assert_eq!(driver.outputs().level(5), Some(true));
    }

    #[test]
    fn failed_writes_are_remembered_until_retried() {
        let mut outputs = RecordingOutputs::default();
        outputs.fail_lines.insert(5);
        let mut driver = RelayDriver::new(outputs, false);

        assert_eq!(driver.apply(&writes(&[4, 5]), 0), 1);
        assert!(driver.has_failed_lines());
        assert_eq!(driver.take_failed(), vec![5]);
        assert!(!driver.has_failed_lines());

        driver.outputs_mut().fail_lines.clear();
        assert_eq!(driver.apply(&writes(&[5]), 0), 1);
        assert!(!driver.has_failed_lines());
    }

    #[test]
    fn repeated_writes_are_harmless() {
        let mut driver = RelayDriver::new(RecordingOutputs::default(), false);
        driver.apply(&writes(&[4]), 0);
        driver.apply(&writes(&[4]), 0);

        assert_eq!(driver.outputs().writes.len(), 2);
        assert_eq!(driver.outputs().level(4), Some(true));
    }
}

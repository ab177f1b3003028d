use std::collections::{HashMap, HashSet};

use crate::{
    relay::{HardwareError, ManualInputs, RelayOutputs},
    types::Line,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedWrite {
    pub at_ms: u64,
    pub line: Line,
    pub high: bool,
}

/// Relay outputs on a virtual clock; pauses advance `now_ms` instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingOutputs {
    pub now_ms: u64,
    pub pauses: usize,
    pub writes: Vec<RecordedWrite>,
    pub fail_lines: HashSet<Line>,
}

impl RecordingOutputs {
    pub fn level(&self, line: Line) -> Option<bool> {
        self.writes
            .iter()
            .rev()
            .find(|write| write.line == line)
            .map(|write| write.high)
    }
}

impl RelayOutputs for RecordingOutputs {
    fn write_level(&mut self, line: Line, high: bool) -> Result<(), HardwareError> {
        if self.fail_lines.contains(&line) {
            return Err(HardwareError::WriteFailed {
                line,
                reason: "injected".to_string(),
            });
        }
        self.writes.push(RecordedWrite {
            at_ms: self.now_ms,
            line,
            high,
        });
        Ok(())
    }

    fn pause_ms(&mut self, ms: u64) {
        self.pauses += 1;
        self.now_ms += ms;
    }
}

#[derive(Debug, Default)]
pub struct FakeInputs {
    pub levels: HashMap<Line, bool>,
}

impl FakeInputs {
    pub fn set(&mut self, line: Line, high: bool) {
        self.levels.insert(line, high);
    }
}

impl ManualInputs for FakeInputs {
    fn read_level(&mut self, line: Line) -> Result<bool, HardwareError> {
        self.levels
            .get(&line)
            .copied()
            .ok_or_else(|| HardwareError::ReadFailed {
                line,
                reason: "not wired".to_string(),
            })
    }
}

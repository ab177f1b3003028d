use std::collections::HashMap;

use log::debug;

use crate::types::Line;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    Accepted,
    Stale { last_accepted: u64 },
}

/// Highest accepted command sequence number per relay line.
#[derive(Debug, Clone, Default)]
pub struct CommandSequencer {
    last_accepted: HashMap<Line, u64>,
}

impl CommandSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, line: Line, seq: Option<u64>, requested_state: bool) -> SequenceVerdict {
        let Some(seq) = seq else {
            return SequenceVerdict::Accepted;
        };

        match self.last_accepted.get(&line) {
            Some(&last) if last >= seq => {
                debug!(
                    "gpio{line}: seq {seq} (state {requested_state}) is not newer than {last}"
                );
                SequenceVerdict::Stale {
                    last_accepted: last,
                }
            }
            _ => {
                self.last_accepted.insert(line, seq);
                SequenceVerdict::Accepted
            }
        }
    }

    pub fn last_accepted(&self, line: Line) -> Option<u64> {
        self.last_accepted.get(&line).copied()
    }

    /// Forgets every line; the counterpart starts a fresh sequence space per session.
    pub fn reset(&mut self) {
        self.last_accepted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_equal_and_older_sequence_numbers() {
        let mut sequencer = CommandSequencer::new();

        assert_eq!(sequencer.accept(4, Some(5), true), SequenceVerdict::Accepted);
        assert_eq!(
            sequencer.accept(4, Some(5), true),
            SequenceVerdict::Stale { last_accepted: 5 }
        );
        assert_eq!(
            sequencer.accept(4, Some(3), true),
            SequenceVerdict::Stale { last_accepted: 5 }
        );
        assert_eq!(sequencer.accept(4, Some(6), true), SequenceVerdict::Accepted);
        assert_eq!(sequencer.last_accepted(4), Some(6));
    }

    #[test]
    fn lines_are_ordered_independently() {
        let mut sequencer = CommandSequencer::new();

        assert_eq!(sequencer.accept(4, Some(10), true), SequenceVerdict::Accepted);
        assert_eq!(sequencer.accept(5, Some(1), true), SequenceVerdict::Accepted);
        assert_eq!(sequencer.last_accepted(5), Some(1));
    }

    #[test]
    fn missing_sequence_is_always_accepted_and_not_recorded() {
        let mut sequencer = CommandSequencer::new();
        sequencer.accept(4, Some(9), true);

        assert_eq!(sequencer.accept(4, None, true), SequenceVerdict::Accepted);
        assert_eq!(sequencer.last_accepted(4), Some(9));
    }

    #[test]
    fn reset_reopens_the_sequence_space() {
        let mut sequencer = CommandSequencer::new();
        sequencer.accept(4, Some(9), true);
        sequencer.reset();

        assert_eq!(sequencer.last_accepted(4), None);
        assert_eq!(sequencer.accept(4, Some(1), true), SequenceVerdict::Accepted);
    }
}

use std::collections::BTreeMap;

use crate::envelope::Sequence;

/// Dispatch-order number of a record within one run.
pub type Ticket = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Applied or skipped; the record never needs another look.
    Completed,
    /// Given up on without a verdict (shutdown mid-retry, fatal error).
    Abandoned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    Dispatched { ticket: Ticket, sequence: Sequence },
    Finished { ticket: Ticket, outcome: Outcome },
}

/// Turns out-of-order completions into the highest sequence below which
/// every record is done.
///
/// Tickets must be dispatched in increasing order. Once a ticket is
/// abandoned nothing after it is ever released in this run.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    pending: BTreeMap<Ticket, Slot>,
    released: Option<Sequence>,
    blocked: bool,
}

#[derive(Debug)]
struct Slot {
    sequence: Sequence,
    outcome: Option<Outcome>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&mut self, ticket: Ticket, sequence: Sequence) {
        self.pending.insert(
            ticket,
            Slot {
                sequence,
                outcome: None,
            },
        );
    }

    /// Records a verdict; returns the new release point when it moved.
    pub fn finished(&mut self, ticket: Ticket, outcome: Outcome) -> Option<Sequence> {
        if let Some(slot) = self.pending.get_mut(&ticket) {
            slot.outcome = Some(outcome);
        }
        self.advance()
    }

    pub fn observe(&mut self, event: ProgressEvent) -> Option<Sequence> {
        match event {
            ProgressEvent::Dispatched { ticket, sequence } => {
                self.dispatched(ticket, sequence);
                None
            }
            ProgressEvent::Finished { ticket, outcome } => self.finished(ticket, outcome),
        }
    }

    pub fn released(&self) -> Option<&Sequence> {
        self.released.as_ref()
    }

    /// Dispatched records without a verdict.
    pub fn in_flight(&self) -> usize {
        self.pending
            .values()
            .filter(|slot| slot.outcome.is_none())
            .count()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    fn advance(&mut self) -> Option<Sequence> {
        if self.blocked {
            return None;
        }
        let mut moved = false;
        while let Some(entry) = self.pending.first_entry() {
            match entry.get().outcome {
                Some(Outcome::Completed) => {
                    let slot = entry.remove();
                    // Redelivered records may carry a lower sequence.
                    if self
                        .released
                        .as_ref()
                        .is_none_or(|released| slot.sequence > *released)
                    {
                        self.released = Some(slot.sequence);
                        moved = true;
                    }
                }
                Some(Outcome::Abandoned) => {
                    self.blocked = true;
                    break;
                }
                None => break,
            }
        }
        if moved { self.released.clone() } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(value: u64) -> Sequence {
        Sequence::new(format!("{value:020}"))
    }

    fn tracker(count: u64) -> ProgressTracker {
        let mut tracker = ProgressTracker::new();
        for ticket in 0..count {
            tracker.dispatched(ticket, seq(ticket + 1));
        }
        tracker
    }

    #[test]
    fn releases_only_the_contiguous_prefix() {
        let mut tracker = tracker(3);
        assert_eq!(tracker.finished(1, Outcome::Completed), None);
        assert_eq!(tracker.finished(2, Outcome::Completed), None);
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.finished(0, Outcome::Completed), Some(seq(3)));
        assert_eq!(tracker.released(), Some(&seq(3)));
    }

    #[test]
    fn abandoned_ticket_blocks_everything_after_it() {
        let mut tracker = tracker(3);
        assert_eq!(tracker.finished(0, Outcome::Completed), Some(seq(1)));
        assert_eq!(tracker.finished(1, Outcome::Abandoned), None);
        assert_eq!(tracker.finished(2, Outcome::Completed), None);
        assert!(tracker.is_blocked());
        assert_eq!(tracker.released(), Some(&seq(1)));
    }

    #[test]
    fn replayed_lower_sequence_never_moves_backwards() {
        let mut tracker = ProgressTracker::new();
        tracker.dispatched(0, seq(5));
        tracker.dispatched(1, seq(4));
        assert_eq!(tracker.finished(0, Outcome::Completed), Some(seq(5)));
        assert_eq!(tracker.finished(1, Outcome::Completed), None);
        assert_eq!(tracker.released(), Some(&seq(5)));
    }

    #[test]
    fn events_replay_through_observe() {
        let mut tracker = ProgressTracker::new();
        let events = [
            ProgressEvent::Dispatched {
                ticket: 0,
                sequence: seq(1),
            },
            ProgressEvent::Dispatched {
                ticket: 1,
                sequence: seq(2),
            },
            ProgressEvent::Finished {
                ticket: 1,
                outcome: Outcome::Completed,
            },
        ];
        for event in events {
            assert_eq!(tracker.observe(event), None);
        }
        let released = tracker.observe(ProgressEvent::Finished {
            ticket: 0,
            outcome: Outcome::Completed,
        });
        assert_eq!(released, Some(seq(2)));
    }
}

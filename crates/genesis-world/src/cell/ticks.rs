//! Scheduled ticks attached to a cell.

use ahash::AHashSet;
use genesis_common::{BlockPos, ContentId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Priority of a scheduled tick; lower runs first among ticks due on the
/// same game time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum TickPriority {
    /// Runs before everything else
    ExtremelyHigh,
    /// Very high priority
    VeryHigh,
    /// High priority
    High,
    /// Default priority
    #[default]
    Normal,
    /// Low priority
    Low,
    /// Very low priority
    VeryLow,
    /// Runs after everything else
    ExtremelyLow,
}

/// A tick scheduled for a position.
///
/// Field order defines execution order: deadline, then priority, then
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduledTick {
    /// Game time at which the tick becomes due
    pub deadline: u64,
    /// Priority among ticks with the same deadline
    pub priority: TickPriority,
    /// Insertion order
    pub sub_order: u64,
    /// Position the tick targets
    pub pos: BlockPos,
    /// Content the tick was scheduled for
    pub content: ContentId,
}

/// Queue of scheduled ticks, with at most one entry per `(pos, content)`.
#[derive(Debug, Clone, Default)]
pub struct TickSchedule {
    queue: BinaryHeap<Reverse<ScheduledTick>>,
    scheduled: AHashSet<(BlockPos, ContentId)>,
    next_sub_order: u64,
}

impl TickSchedule {
    /// Creates an empty schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a tick. Returns false if one is already pending for the
    /// same position and content.
    pub fn schedule(
        &mut self,
        pos: BlockPos,
        content: ContentId,
        deadline: u64,
        priority: TickPriority,
    ) -> bool {
        if !self.scheduled.insert((pos, content)) {
            return false;
        }
        let sub_order = self.next_sub_order;
        self.next_sub_order += 1;
        self.queue.push(Reverse(ScheduledTick {
            deadline,
            priority,
            sub_order,
            pos,
            content,
        }));
        true
    }

    /// Whether a tick is pending for `(pos, content)`.
    #[must_use]
    pub fn is_scheduled(&self, pos: BlockPos, content: ContentId) -> bool {
        self.scheduled.contains(&(pos, content))
    }

    /// Removes and returns every tick due at or before `now`, in execution
    /// order.
    pub fn pop_due(&mut self, now: u64) -> Vec<ScheduledTick> {
        let mut due = Vec::new();
        while self.queue.peek().is_some_and(|Reverse(t)| t.deadline <= now) {
            if let Some(Reverse(tick)) = self.queue.pop() {
                self.scheduled.remove(&(tick.pos, tick.content));
                due.push(tick);
            }
        }
        due
    }

    /// Number of pending ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pending ticks in execution order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<ScheduledTick> {
        let mut ticks: Vec<_> = self.queue.iter().map(|Reverse(t)| t.clone()).collect();
        ticks.sort();
        ticks
    }

    /// Rebuilds a schedule from [`TickSchedule::to_vec`] output, keeping
    /// relative order.
    #[must_use]
    pub fn from_ticks(ticks: Vec<ScheduledTick>) -> Self {
        let mut schedule = Self::new();
        let mut ticks = ticks;
        ticks.sort();
        for tick in ticks {
            schedule.schedule(tick.pos, tick.content, tick.deadline, tick.priority);
        }
        schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_rejected() {
        let mut ticks = TickSchedule::new();
        let pos = BlockPos::new(1, 2, 3);
        assert!(ticks.schedule(pos, ContentId::new(1), 10, TickPriority::Normal));
        assert!(!ticks.schedule(pos, ContentId::new(1), 5, TickPriority::High));
        assert!(ticks.schedule(pos, ContentId::new(2), 5, TickPriority::High));
        assert_eq!(ticks.len(), 2);
    }

    #[test]
    fn test_due_order() {
        let mut ticks = TickSchedule::new();
        let a = BlockPos::new(0, 0, 0);
        let b = BlockPos::new(1, 0, 0);
        let c = BlockPos::new(2, 0, 0);
        ticks.schedule(a, ContentId::new(1), 4, TickPriority::Low);
        ticks.schedule(b, ContentId::new(1), 4, TickPriority::High);
        ticks.schedule(c, ContentId::new(1), 9, TickPriority::ExtremelyHigh);

        let due = ticks.pop_due(5);
        let order: Vec<_> = due.iter().map(|t| t.pos).collect();
        assert_eq!(order, vec![b, a]);
        assert!(!ticks.is_scheduled(a, ContentId::new(1)));
        assert_eq!(ticks.len(), 1);
        assert!(ticks.pop_due(8).is_empty());
    }

    #[test]
    fn test_rebuild_keeps_order() {
        let mut ticks = TickSchedule::new();
        for x in 0..4 {
            ticks.schedule(BlockPos::new(x, 0, 0), ContentId::new(1), 3, TickPriority::Normal);
        }
        let rebuilt = TickSchedule::from_ticks(ticks.to_vec());
        let positions: Vec<_> = rebuilt.to_vec().iter().map(|t| t.pos.x).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }
}

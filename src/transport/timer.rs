//! Deadline scheduler for per-connection timers
//!
//! Entries name a connection by identity and carry the generation of the
//! timer slot that armed them. The scheduler never holds a connection; a
//! popped entry whose connection is gone, or whose generation is no longer
//! current, is simply ignored by the caller.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::transport::connection::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    Retransmission,
    TimeWait,
    Keepalive,
    FinWait2,
}

/// One scheduled deadline
///
/// Field order gives the firing order: earliest deadline first, then the
/// connection created first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerEntry {
    pub deadline: Instant,
    pub conn: ConnectionId,
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct TimerScheduler {
    heap: BinaryHeap<Reverse<TimerEntry>>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, entry: TimerEntry) {
        self.heap.push(Reverse(entry));
    }

    /// Earliest pending deadline, stale entries included
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Remove and return the earliest entry due at `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerEntry> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.deadline <= now => self.heap.pop().map(|Reverse(e)| e),
            _ => None,
        }
    }

    /// Drop every entry belonging to `conn`
    pub fn cancel_connection(&mut self, conn: ConnectionId) {
        self.heap.retain(|Reverse(entry)| entry.conn != conn);
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Per-connection view of one timer kind
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerSlot {
    generation: u64,
    deadline: Option<Instant>,
}

impl TimerSlot {
    /// Arm (or re-arm) this slot, superseding any earlier entry
    pub fn arm(
        &mut self,
        scheduler: &mut TimerScheduler,
        conn: ConnectionId,
        kind: TimerKind,
        deadline: Instant,
    ) {
        self.generation += 1;
        self.deadline = Some(deadline);
        scheduler.schedule(TimerEntry {
            deadline,
            conn,
            kind,
            generation: self.generation,
        });
    }

    pub fn disarm(&mut self) {
        self.generation += 1;
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Consume `entry` if it is the live arming of this slot
    pub fn fire(&mut self, entry: &TimerEntry) -> bool {
        if self.deadline.is_some() && entry.generation == self.generation {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

use std::{cmp::Reverse, collections::BinaryHeap};

use tokio::time::Instant;

use crate::message::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    /// The request must be finished by now.
    Deadline,
    /// Send a leg to its watcher again. Only honoured if the leg's generation still matches when the timer fires.
    Redispatch { request_idx: usize, generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timer {
    pub at: Instant,
    seq: u64,
    pub request_id: RequestId,
    pub kind: TimerKind,
}

/// Pending per-request timers, ordered by expiry.
///
/// Timers are never cancelled. Owners discard timers whose request or leg has moved on when they fire, which keeps
/// scheduling a heap push.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Timer>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, request_id: RequestId, kind: TimerKind) {
        // The sequence number keeps timers with equal expiry in scheduling order.
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Timer {
            at,
            seq,
            request_id,
            kind,
        }));
    }

    /// When the earliest timer fires, if there is one.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(timer)| timer.at)
    }

    /// Removes and returns the earliest timer if it has expired by `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Timer> {
        match self.heap.peek() {
            Some(Reverse(timer)) if timer.at <= now => self.heap.pop().map(|Reverse(timer)| timer),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

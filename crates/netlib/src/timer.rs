//! Repeating timers and per-pass loop callbacks.
//!
//! BinaryHeap min-heap keyed by deadline, with lazy cancellation: a
//! cancelled id is dropped from the active table immediately and its heap
//! entry is skipped when it surfaces.
//!
//! # Complexity
//!
//! - Add: O(log n)
//! - Cancel: O(1)
//! - Pop due: O(k log n) where k = number of due timers
//!
//! The queue never invokes anything; it hands due handlers back to the
//! reactor, which delivers them after releasing its own borrows.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use netlib_core::{NetError, Result, SharedHandler, TimerId};

/// Heap ordering wrapper (min-heap by deadline, tie-break by id).
#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    id: TimerId,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

struct Periodic {
    interval: Duration,
    deadline: Instant,
    handler: SharedHandler,
}

/// A handler that is due, paired with the registration that fired.
pub type Due = (TimerId, SharedHandler);

pub struct TimerQueue {
    heap: BinaryHeap<HeapEntry>,
    timers: HashMap<TimerId, Periodic>,
    loops: Vec<(TimerId, SharedHandler)>,
    next_id: u64,

    /// Stats: total timer deliveries handed out
    total_fired: u64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            timers: HashMap::new(),
            loops: Vec::new(),
            next_id: 1,
            total_fired: 0,
        }
    }

    fn allocate_id(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Schedule `handler` every `interval`, first firing at `now + interval`.
    pub fn add(&mut self, handler: SharedHandler, interval: Duration, now: Instant) -> Result<TimerId> {
        if interval.is_zero() {
            return Err(NetError::InvalidInterval);
        }
        let id = self.allocate_id();
        let deadline = now + interval;
        self.timers.insert(id, Periodic { interval, deadline, handler });
        self.heap.push(HeapEntry { deadline, id });
        Ok(id)
    }

    /// Deliver to `handler` once per dispatch pass.
    pub fn add_loop(&mut self, handler: SharedHandler) -> TimerId {
        let id = self.allocate_id();
        self.loops.push((id, handler));
        id
    }

    /// Remove a timer or loop callback. False if `id` was not active.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.timers.remove(&id).is_some() {
            // Heap entry is skipped lazily.
            if self.timers.is_empty() {
                self.heap.clear();
            }
            return true;
        }
        let before = self.loops.len();
        self.loops.retain(|(lid, _)| *lid != id);
        self.loops.len() != before
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id) || self.loops.iter().any(|(lid, _)| *lid == id)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop every timer due at `now` and reschedule it. Each timer appears at
    /// most once per call.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Due> {
        let mut due = Vec::new();
        loop {
            self.discard_stale();
            match self.heap.peek() {
                Some(entry) if entry.deadline <= now => {}
                _ => break,
            }
            let Some(entry) = self.heap.pop() else { break };
            let Some(timer) = self.timers.get_mut(&entry.id) else {
                continue;
            };

            // Fell behind by more than one interval: skip the missed ticks
            // instead of firing a burst.
            let mut next = timer.deadline + timer.interval;
            if next <= now {
                next = now + timer.interval;
            }
            timer.deadline = next;
            due.push((entry.id, timer.handler.clone()));
            self.heap.push(HeapEntry { deadline: next, id: entry.id });
        }
        self.total_fired += due.len() as u64;
        due
    }

    /// Snapshot of the loop callbacks, in registration order.
    pub fn loop_handlers(&self) -> Vec<Due> {
        self.loops.clone()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    pub fn total_fired(&self) -> u64 {
        self.total_fired
    }

    /// Pop heap entries whose timer was cancelled or rescheduled.
    fn discard_stale(&mut self) {
        while let Some(entry) = self.heap.peek() {
            match self.timers.get(&entry.id) {
                Some(t) if t.deadline == entry.deadline => return,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

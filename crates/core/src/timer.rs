//! Fixed-delay deferral queue driven by the owning control loop.
//!
//! - Entries fire in deadline order; equal deadlines fire in insertion order
//! - The queue never reads the clock; `now` is always supplied by the caller
//! - Cancelling an unknown or already-fired timer is a no-op

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Handle for a scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Deferred payloads keyed by (deadline, insertion order).
#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: BTreeMap<(Instant, TimerId), T>,
    /// TimerId → deadline, for cancellation.
    deadlines: HashMap<TimerId, Instant>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `payload` to fire once `now >= deadline`.
    pub fn schedule(&mut self, deadline: Instant, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        self.entries.insert((deadline, id), payload);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Remove a pending entry, returning its payload if it had not fired.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.entries.remove(&(deadline, id))
    }

    /// Remove and return every entry whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();

        while let Some(entry) = self.entries.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            due.push(entry.remove());
            self.deadlines.remove(&id);
        }

        due
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Drop every pending entry without firing it.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

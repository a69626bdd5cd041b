//! Seat allocation for the session server.
//!
//! - Fixed-size pool, sized once at startup
//! - Lowest free index is handed out first
//! - Releasing a free seat is a no-op
//! - Exhaustion is reported, never waited on

use std::collections::BTreeSet;

use seatsync_core::SeatIndex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeatError {
    #[error("all {capacity} seats are occupied")]
    Exhausted { capacity: usize },

    #[error("seat {seat} is outside a pool of {capacity}")]
    OutOfRange { seat: SeatIndex, capacity: usize },
}

/// Pool of mutually exclusive seats.
///
/// Every seat index in `0..capacity` is in exactly one of `free` or
/// `occupied`.
#[derive(Debug, Clone)]
pub struct SeatAllocator {
    capacity: usize,
    free: BTreeSet<SeatIndex>,
    occupied: BTreeSet<SeatIndex>,
}

impl SeatAllocator {
    pub fn new(capacity: SeatIndex) -> Self {
        Self {
            capacity: capacity as usize,
            free: (0..capacity).collect(),
            occupied: BTreeSet::new(),
        }
    }

    /// Take the lowest free seat.
    pub fn acquire(&mut self) -> Result<SeatIndex, SeatError> {
        let seat = self.free.pop_first().ok_or(SeatError::Exhausted {
            capacity: self.capacity,
        })?;
        self.occupied.insert(seat);
        Ok(seat)
    }

    /// Return a seat to the pool.
    ///
    /// Returns `Ok(false)` if the seat was already free.
    pub fn release(&mut self, seat: SeatIndex) -> Result<bool, SeatError> {
        if seat as usize >= self.capacity {
            return Err(SeatError::OutOfRange {
                seat,
                capacity: self.capacity,
            });
        }
        if self.occupied.remove(&seat) {
            self.free.insert(seat);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Free every seat.
    pub fn reset(&mut self) {
        let occupied = std::mem::take(&mut self.occupied);
        self.free.extend(occupied);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.len()
    }

    pub fn is_occupied(&self, seat: SeatIndex) -> bool {
        self.occupied.contains(&seat)
    }

    pub fn free_seats(&self) -> impl Iterator<Item = SeatIndex> + '_ {
        self.free.iter().copied()
    }

    pub fn occupied_seats(&self) -> impl Iterator<Item = SeatIndex> + '_ {
        self.occupied.iter().copied()
    }
}

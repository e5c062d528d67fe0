//! Monotonic timestamp sources for captured events.
//!
//! The clock is the single source of capture time for an engine. Every
//! reading is a [`Timestamp`] measured in nanoseconds since the clock's
//! origin.
//!
//! # Design Principles
//!
//! - Readings from one clock are totally ordered: [`MonotonicClock`] never
//!   returns the same value twice, even to concurrent callers.
//! - No wall-clock guarantees. Timestamps from different clocks are not
//!   comparable.
//! - Tests inject [`ManualClock`] to get deterministic timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use retrace_types::Timestamp;

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// The clock would move past `u64::MAX` nanoseconds.
    #[error("clock overflow: cannot advance beyond u64::MAX nanoseconds")]
    Overflow,

    /// A manual clock was asked to move backwards.
    #[error("clock cannot move backwards: current {current}, requested {requested}")]
    Backwards {
        /// The current reading.
        current: Timestamp,
        /// The rejected reading.
        requested: Timestamp,
    },
}

/// A source of monotonic capture timestamps.
pub trait Clock: Send + Sync {
    /// Return the current time. Successive calls never go backwards.
    fn now(&self) -> Timestamp;
}

/// Production clock backed by [`Instant`].
///
/// A high-water mark makes readings strictly increasing: if two callers
/// observe the same elapsed nanosecond, the later one is bumped by 1ns.
#[derive(Debug)]
pub struct MonotonicClock {
    /// The instant that maps to [`Timestamp::ZERO`].
    origin: Instant,

    /// The last value handed out.
    last: AtomicU64,
}

impl MonotonicClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Nanoseconds elapsed since the origin, saturating at `u64::MAX`.
    fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.elapsed_nanos();
        let mut previous = self.last.load(Ordering::Acquire);
        loop {
            let next = elapsed.max(previous.saturating_add(1));
            match self.last.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Timestamp::from_nanos(next),
                Err(actual) => previous = actual,
            }
        }
    }
}

/// Deterministic clock for tests.
///
/// Reads return whatever was last set; the clock only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    /// Current reading in nanoseconds.
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at `start`.
    pub const fn starting_at(start: Timestamp) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos()),
        }
    }

    /// Move the clock forward by `nanos`. Returns the new reading.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Overflow`] if the clock would pass `u64::MAX`.
    pub fn advance(&self, nanos: u64) -> Result<Timestamp, ClockError> {
        let mut current = self.nanos.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(nanos).ok_or(ClockError::Overflow)?;
            match self
                .nanos
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(Timestamp::from_nanos(next)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Jump to `at`.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Backwards`] if `at` is before the current reading.
    pub fn set(&self, at: Timestamp) -> Result<(), ClockError> {
        let current = Timestamp::from_nanos(self.nanos.load(Ordering::Acquire));
        if at < current {
            return Err(ClockError::Backwards {
                current,
                requested: at,
            });
        }
        self.nanos.store(at.as_nanos(), Ordering::Release);
        Ok(())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

//! Monotonic virtual clock and duration helpers.
//!
//! The clock holds a single non-negative tick counter. It only ever moves
//! forward; asking it to go back is an internal invariant violation and
//! fails loudly.

use crate::fixed::Ticks;

// ---------------------------------------------------------------------------
// Duration helpers
// ---------------------------------------------------------------------------

/// One tick per second is the convention used by these helpers. The kernel
/// itself treats ticks as opaque; a host that prefers a different base unit
/// can ignore these and pass raw tick counts.
pub const fn seconds(n: u64) -> Ticks {
    n
}

/// `n` hours in ticks.
pub const fn hours(n: u64) -> Ticks {
    n * 3_600
}

/// `n` days in ticks.
pub const fn days(n: u64) -> Ticks {
    n * 86_400
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Error raised when the clock is asked to move backwards.
#[derive(Debug, thiserror::Error)]
#[error("clock cannot move backwards: at {now}, asked to advance to {target}")]
pub struct ClockError {
    pub now: Ticks,
    pub target: Ticks,
}

/// Monotonic virtual-time counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Clock {
    now: Ticks,
}

impl Clock {
    /// A clock starting at tick zero.
    pub fn new() -> Self {
        Self { now: 0 }
    }

    /// Current virtual time.
    pub fn now(&self) -> Ticks {
        self.now
    }

    /// Advance to `target`. Advancing to the current reading is a no-op.
    pub fn advance_to(&mut self, target: Ticks) -> Result<(), ClockError> {
        if target < self.now {
            return Err(ClockError {
                now: self.now,
                target,
            });
        }
        self.now = target;
        Ok(())
    }
}

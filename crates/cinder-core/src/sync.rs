//! # Sync Point Arithmetic
//!
//! Sync points are 32-bit counters that wrap. Every comparison between two
//! counter values goes through this module.

use core::time::Duration;

// =============================================================================
// WRAP-SAFE COMPARISONS
// =============================================================================

/// Walking forward from `a`, is `b` reached strictly before `c`?
///
/// `b == a` counts as reached immediately; if `c == a` nothing is before it.
#[inline]
pub const fn is_between(a: u32, b: u32, c: u32) -> bool {
    b.wrapping_sub(a) < c.wrapping_sub(a)
}

/// Is `thresh` already satisfied for a counter whose live window is
/// `(min, max]`?
///
/// Values inside the window are still pending; everything else is
/// considered reached.
#[inline]
pub const fn is_expired(min: u32, thresh: u32, max: u32) -> bool {
    max.wrapping_sub(thresh) >= min.wrapping_sub(thresh)
}

/// Has a counter at `value` reached `thresh`?
///
/// Valid while the two are less than 2^31 apart.
#[inline]
pub const fn has_reached(value: u32, thresh: u32) -> bool {
    value.wrapping_sub(thresh) as i32 >= 0
}

// =============================================================================
// WAIT TIMEOUT
// =============================================================================

/// How long a CPU wait may block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitTimeout {
    /// No timeout (return immediately).
    None,
    /// Wait with timeout.
    Duration(Duration),
    /// Wait indefinitely.
    #[default]
    Infinite,
}

impl WaitTimeout {
    /// Create a timeout in milliseconds.
    pub const fn millis(ms: u64) -> Self {
        WaitTimeout::Duration(Duration::from_millis(ms))
    }

    /// Get duration or None for infinite.
    pub const fn as_duration(&self) -> Option<Duration> {
        match self {
            WaitTimeout::None => Some(Duration::ZERO),
            WaitTimeout::Duration(d) => Some(*d),
            WaitTimeout::Infinite => None,
        }
    }

    /// Check if infinite.
    pub const fn is_infinite(&self) -> bool {
        matches!(self, WaitTimeout::Infinite)
    }
}

impl From<Duration> for WaitTimeout {
    fn from(d: Duration) -> Self {
        WaitTimeout::Duration(d)
    }
}

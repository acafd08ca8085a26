//! Remaining cooldown of a key, counted in decay ticks

use std::time::Duration;

use crate::error::Error;

/// Decay ticks left before a key may be used again. Zero means ready.
///
/// With the default one-second tick a cooldown of 60 is sixty seconds. The
/// value is unsigned; signed input from outside (admin calls, config) goes
/// through `TryFrom<i64>`, which rejects negatives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cooldown(u64);

impl Cooldown {
    pub const READY: Cooldown = Cooldown(0);

    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    pub const fn ticks(self) -> u64 {
        self.0
    }

    pub const fn is_ready(self) -> bool {
        self.0 == 0
    }

    /// Whole ticks needed to cover `duration`, rounded up.
    pub fn from_duration(duration: Duration, tick: Duration) -> Self {
        let tick_nanos = tick.as_nanos().max(1);
        let ticks = duration.as_nanos().div_ceil(tick_nanos);
        Self(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    /// Wall-clock time this cooldown represents at the given tick interval.
    pub fn as_duration(self, tick: Duration) -> Duration {
        let ticks = u32::try_from(self.0).unwrap_or(u32::MAX);
        tick.checked_mul(ticks).unwrap_or(Duration::MAX)
    }

    /// One decay step. Never goes below zero.
    pub(crate) const fn decremented(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl From<u64> for Cooldown {
    fn from(ticks: u64) -> Self {
        Self(ticks)
    }
}

impl TryFrom<i64> for Cooldown {
    type Error = Error;

    fn try_from(ticks: i64) -> Result<Self, Error> {
        u64::try_from(ticks)
            .map(Self)
            .map_err(|_| Error::InvalidCooldown(ticks))
    }
}

//! Kernel time.

use crate::config::TICK_HZ;

/// In-kernel timestamp, counted in SysTick ticks since `kernel::init`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Timestamp(0);

    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Advance by one tick.
    pub fn bump(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// This timestamp moved forward by `ms` milliseconds.
    pub const fn after_ms(self, ms: u32) -> Self {
        Timestamp(self.0 + ms_to_ticks(ms))
    }

    /// Ticks from `now` until `self`, or zero if `self` already passed.
    pub const fn ticks_after(self, now: Timestamp) -> u64 {
        self.0.saturating_sub(now.0)
    }

    /// Milliseconds from `now` until `self`, zero if `self` already passed.
    pub const fn ms_after(self, now: Timestamp) -> u32 {
        let ms = ticks_to_ms(self.ticks_after(now));
        if ms > u32::MAX as u64 {
            u32::MAX
        } else {
            ms as u32
        }
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

pub const fn ms_to_ticks(ms: u32) -> u64 {
    ms as u64 * TICK_HZ as u64 / 1000
}

pub const fn ticks_to_ms(ticks: u64) -> u64 {
    ticks * 1000 / TICK_HZ as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_arithmetic() {
        let now = Timestamp::from(100);
        let deadline = now.after_ms(250);
        assert_eq!(deadline.ticks(), 350);
        assert_eq!(deadline.ticks_after(now), 250);
        assert_eq!(now.ticks_after(deadline), 0);
        assert_eq!(deadline.ms_after(now.after_ms(40)), 210);
        assert_eq!(now.ms_after(deadline), 0);
    }

    #[test]
    fn test_bump() {
        let mut t = Timestamp::ZERO;
        t.bump();
        t.bump();
        assert_eq!(u64::from(t), 2);
        assert_eq!(ticks_to_ms(t.ticks()), 2);
    }
}

//! Counting semaphores.
//!
//! The count is an [`AtomicCounter`], so `post` and `try_wait` are safe from
//! interrupt handlers and from inside a wake condition. Blocking waits go
//! through the scheduler's wait primitive: the waiter sleeps on a
//! [`WaitCondition::Semaphore`](crate::wait::WaitCondition) which dispatch
//! polls with `try_wait`.

use core::fmt;

use crate::atomic::AtomicCounter;
#[cfg(feature = "tasks")]
use crate::{
    err::WaitError,
    wait::{WaitCondition, WAKE_SHUTDOWN, WAKE_TIMEOUT},
};
#[cfg(all(feature = "tasks", target_arch = "arm", target_os = "none"))]
use crate::{kernel, time::Timestamp};

pub struct Semaphore {
    count: AtomicCounter,
}

impl Semaphore {
    pub const fn new(value: u8) -> Self {
        Self {
            count: AtomicCounter::new(value),
        }
    }

    /// Reset the count. Only valid while nobody is waiting.
    pub fn init(&self, value: u8) {
        self.count.set(value);
    }

    /// Semaphores hold no resources; kept so callers can pair it with
    /// `init`.
    pub fn destroy(&self) {}

    /// Release one unit. Never blocks. A count already at 255 stays there
    /// and the call returns `false`.
    pub fn post(&self) -> bool {
        if self.count.try_increment() {
            true
        } else {
            log::warn!("semaphore count saturated, post dropped");
            false
        }
    }

    /// Take one unit if available. Never blocks.
    pub fn try_wait(&self) -> bool {
        self.count.try_decrement()
    }

    pub fn value(&self) -> u8 {
        self.count.get()
    }

    /// Take one unit, sleeping until one is posted. Fails only if the
    /// calling task is asked to shut down before a unit arrives.
    #[cfg(all(feature = "tasks", target_arch = "arm", target_os = "none"))]
    pub fn wait(&'static self) -> Result<(), WaitError> {
        self.acquire(WaitCondition::Semaphore(self), kernel::wait_event)
    }

    /// Like [`wait`](Self::wait) but gives up at `deadline`.
    #[cfg(all(feature = "tasks", target_arch = "arm", target_os = "none"))]
    pub fn timed_wait(&'static self, deadline: Timestamp) -> Result<(), WaitError> {
        self.acquire(WaitCondition::SemaphoreUntil(self, deadline), kernel::wait_event)
    }

    /// Take a unit at once if one is there, otherwise sleep on `cond`
    /// through `wait_event`.
    #[cfg(feature = "tasks")]
    #[cfg_attr(not(all(target_arch = "arm", target_os = "none")), allow(dead_code))]
    pub(crate) fn acquire(
        &'static self,
        cond: WaitCondition,
        wait_event: impl FnOnce(WaitCondition) -> u32,
    ) -> Result<(), WaitError> {
        if self.try_wait() {
            return Ok(());
        }
        match wait_event(cond) {
            WAKE_SHUTDOWN => Err(WaitError::Shutdown),
            WAKE_TIMEOUT => Err(WaitError::TimedOut),
            _ => Ok(()),
        }
    }

    /// Without a scheduler there is nobody to switch to; spin until an
    /// interrupt handler posts.
    #[cfg(not(feature = "tasks"))]
    pub fn wait(&self) {
        while !self.try_wait() {
            core::hint::spin_loop();
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore").field("count", &self.value()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_and_try_wait() {
        let sem = Semaphore::new(0);
        assert!(!sem.try_wait());
        sem.post();
        sem.post();
        assert_eq!(sem.value(), 2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_init_resets_count() {
        let sem = Semaphore::default();
        sem.init(3);
        assert_eq!(sem.value(), 3);
        sem.destroy();
        assert_eq!(sem.value(), 3);
    }

    #[test]
    fn test_post_saturates_instead_of_wrapping() {
        let sem = Semaphore::new(255);
        assert!(!sem.post());
        assert_eq!(sem.value(), 255);
        assert!(sem.try_wait());
        assert!(sem.post());
        assert_eq!(sem.value(), 255);
    }

    #[cfg(feature = "tasks")]
    #[test]
    fn test_acquire_takes_available_unit_without_blocking() {
        static SEM: Semaphore = Semaphore::new(1);
        let r = SEM.acquire(WaitCondition::Semaphore(&SEM), |_| {
            panic!("blocked although a unit was available")
        });
        assert_eq!(r, Ok(()));
        assert_eq!(SEM.value(), 0);
    }

    #[cfg(feature = "tasks")]
    #[test]
    fn test_acquire_maps_wake_values() {
        static SEM: Semaphore = Semaphore::new(0);
        let cond = WaitCondition::Semaphore(&SEM);
        assert_eq!(SEM.acquire(cond, |_| WAKE_SHUTDOWN), Err(WaitError::Shutdown));
        assert_eq!(SEM.acquire(cond, |_| WAKE_TIMEOUT), Err(WaitError::TimedOut));
        assert_eq!(SEM.acquire(cond, |_| crate::wait::WAKE_READY), Ok(()));
    }

    #[cfg(not(feature = "tasks"))]
    #[test]
    fn test_wait_without_scheduler_takes_available_unit() {
        let sem = Semaphore::new(1);
        sem.wait();
        assert_eq!(sem.value(), 0);
    }
}

//! Wake conditions.
//!
//! A waiting task carries one [`WaitCondition`]. Dispatch polls it every time
//! the scan passes the task; a non-zero result wakes the task and is handed
//! back to it as the wake value. Polling runs inside the context switch, so
//! a condition must be quick and must never block.

use core::fmt;

use crate::critsec::TaskLock;
use crate::semaphore::Semaphore;
use crate::task::TaskId;
use crate::time::Timestamp;

/// Wake value for "the thing you waited for happened".
pub const WAKE_READY: u32 = 1;
/// Wake value for "your deadline passed first".
pub const WAKE_TIMEOUT: u32 = 2;
/// Wake value delivered when a shutdown forced the task out of its wait.
pub const WAKE_SHUTDOWN: u32 = 0;

#[derive(Clone, Copy)]
pub enum WaitCondition {
    /// Sleep until the tick clock reaches the deadline.
    Until(Timestamp),
    /// Take one unit of the semaphore.
    Semaphore(&'static Semaphore),
    /// Take one unit of the semaphore or give up at the deadline.
    SemaphoreUntil(&'static Semaphore, Timestamp),
    /// Enter the task lock on behalf of the waiter.
    Lock(&'static TaskLock),
    /// Arbitrary predicate. Must not block and must be safe to run with
    /// task switching suspended.
    Custom { poll: fn(usize) -> u32, arg: usize },
}

impl WaitCondition {
    /// Evaluate the condition for `waiter`. Zero means keep waiting.
    ///
    /// Conditions that consume a resource (semaphore, lock) take it here,
    /// so a non-zero result means the waiter already owns it.
    pub fn poll(&self, now: Timestamp, waiter: TaskId) -> u32 {
        match *self {
            WaitCondition::Until(deadline) => {
                if now >= deadline {
                    WAKE_READY
                } else {
                    0
                }
            }
            WaitCondition::Semaphore(sem) => {
                if sem.try_wait() {
                    WAKE_READY
                } else {
                    0
                }
            }
            WaitCondition::SemaphoreUntil(sem, deadline) => {
                if sem.try_wait() {
                    WAKE_READY
                } else if now >= deadline {
                    WAKE_TIMEOUT
                } else {
                    0
                }
            }
            WaitCondition::Lock(lock) => {
                if lock.try_enter(waiter) {
                    WAKE_READY
                } else {
                    0
                }
            }
            WaitCondition::Custom { poll, arg } => poll(arg),
        }
    }
}

impl fmt::Debug for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::Until(t) => f.debug_tuple("Until").field(t).finish(),
            WaitCondition::Semaphore(s) => f.debug_tuple("Semaphore").field(&s.value()).finish(),
            WaitCondition::SemaphoreUntil(s, t) => f
                .debug_tuple("SemaphoreUntil")
                .field(&s.value())
                .field(t)
                .finish(),
            WaitCondition::Lock(l) => f.debug_tuple("Lock").field(&l.holder()).finish(),
            WaitCondition::Custom { arg, .. } => {
                f.debug_struct("Custom").field("arg", arg).finish_non_exhaustive()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: TaskId = TaskId::new(1, 0);

    #[test]
    fn test_until_fires_at_deadline() {
        let c = WaitCondition::Until(Timestamp::from(10));
        assert_eq!(c.poll(Timestamp::from(9), ME), 0);
        assert_eq!(c.poll(Timestamp::from(10), ME), WAKE_READY);
    }

    #[test]
    fn test_semaphore_condition_consumes() {
        static SEM: Semaphore = Semaphore::new(1);
        let c = WaitCondition::Semaphore(&SEM);
        assert_eq!(c.poll(Timestamp::ZERO, ME), WAKE_READY);
        assert_eq!(SEM.value(), 0);
        assert_eq!(c.poll(Timestamp::ZERO, ME), 0);
    }

    #[test]
    fn test_semaphore_until_times_out() {
        static SEM: Semaphore = Semaphore::new(0);
        let c = WaitCondition::SemaphoreUntil(&SEM, Timestamp::from(5));
        assert_eq!(c.poll(Timestamp::from(4), ME), 0);
        assert_eq!(c.poll(Timestamp::from(5), ME), WAKE_TIMEOUT);
        SEM.post();
        assert_eq!(c.poll(Timestamp::from(6), ME), WAKE_READY);
    }

    #[test]
    fn test_lock_condition_enters_for_waiter() {
        static LOCK: TaskLock = TaskLock::new();
        let other = TaskId::new(2, 0);
        assert!(LOCK.try_enter(other));

        let c = WaitCondition::Lock(&LOCK);
        assert_eq!(c.poll(Timestamp::ZERO, ME), 0);
        LOCK.leave();
        assert_eq!(c.poll(Timestamp::ZERO, ME), WAKE_READY);
        assert_eq!(LOCK.holder(), Some(ME));
    }

    #[test]
    fn test_custom_condition_passes_arg() {
        let c = WaitCondition::Custom {
            poll: |arg| arg as u32 * 3,
            arg: 7,
        };
        assert_eq!(c.poll(Timestamp::ZERO, ME), 21);
    }
}

//! Kernel and task critical sections.
//!
//! [`KernelLock`] is the kernel critical-section counter. While it is
//! non-zero the tick handler refuses to switch tasks and retries on the
//! next tick instead. It never blocks, which is what lets the heap use it:
//! a blocking lock would itself need the scheduler, and the scheduler frees
//! stacks through the heap.
//!
//! [`TaskLock`] is the task-level critical section: a nesting count plus the
//! task holding it. Only the holder may re-enter; everybody else waits on it
//! through the scheduler.

#[cfg(feature = "tasks")]
use core::cell::Cell;

#[cfg(feature = "tasks")]
use critical_section::Mutex;

use crate::atomic::AtomicCounter;
#[cfg(feature = "tasks")]
use crate::task::TaskId;
#[cfg(feature = "tasks")]
use crate::{
    err::WaitError,
    wait::{WaitCondition, WAKE_SHUTDOWN},
};
#[cfg(all(feature = "tasks", target_arch = "arm", target_os = "none"))]
use crate::kernel;

// ---------------------------------------------------------------------------
// Kernel lock
// ---------------------------------------------------------------------------

pub struct KernelLock {
    count: AtomicCounter,
}

impl KernelLock {
    pub const fn new() -> Self {
        Self {
            count: AtomicCounter::new(0),
        }
    }

    /// Enter the kernel critical section. Leaving happens when the guard
    /// drops. Sections nest.
    #[must_use = "the critical section ends when the guard is dropped"]
    pub fn enter(&self) -> KernelGuard<'_> {
        self.count.increment();
        KernelGuard { lock: self }
    }

    /// Whether any code is inside the kernel critical section.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.count.get() != 0
    }

    pub fn depth(&self) -> u8 {
        self.count.get()
    }
}

impl Default for KernelLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KernelGuard<'a> {
    lock: &'a KernelLock,
}

impl Drop for KernelGuard<'_> {
    fn drop(&mut self) {
        self.lock.count.decrement();
    }
}

// ---------------------------------------------------------------------------
// Task lock
// ---------------------------------------------------------------------------

#[cfg(feature = "tasks")]
#[derive(Copy, Clone)]
struct Holder {
    count: u8,
    task: Option<TaskId>,
}

/// Re-entrant lock owned by one task at a time.
#[cfg(feature = "tasks")]
pub struct TaskLock {
    state: Mutex<Cell<Holder>>,
}

#[cfg(feature = "tasks")]
impl TaskLock {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(Holder { count: 0, task: None })),
        }
    }

    /// Take the lock for `me` if it is free or `me` already holds it.
    ///
    /// Safe to call from a wake condition.
    pub fn try_enter(&self, me: TaskId) -> bool {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let h = cell.get();
            if h.count == 0 || h.task == Some(me) {
                cell.set(Holder {
                    count: h.count.wrapping_add(1),
                    task: Some(me),
                });
                true
            } else {
                false
            }
        })
    }

    /// Take the lock, sleeping until the holder leaves it. Fails only if
    /// the caller is asked to shut down while waiting.
    #[cfg(all(feature = "tasks", target_arch = "arm", target_os = "none"))]
    pub fn enter(&'static self) -> Result<(), WaitError> {
        self.enter_as(kernel::current(), kernel::wait_event)
    }

    /// Enter for `me` right away if possible, else sleep on the lock
    /// through `wait_event`. The holder re-enters without sleeping.
    #[cfg_attr(not(all(target_arch = "arm", target_os = "none")), allow(dead_code))]
    fn enter_as(
        &'static self,
        me: TaskId,
        wait_event: impl FnOnce(WaitCondition) -> u32,
    ) -> Result<(), WaitError> {
        if self.try_enter(me) {
            return Ok(());
        }
        match wait_event(WaitCondition::Lock(self)) {
            WAKE_SHUTDOWN => Err(WaitError::Shutdown),
            _ => Ok(()),
        }
    }

    /// Drop one level of nesting.
    pub fn leave(&self) {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let h = cell.get();
            let count = h.count.saturating_sub(1);
            cell.set(Holder {
                count,
                task: if count == 0 { None } else { h.task },
            });
        });
    }

    pub fn holder(&self) -> Option<TaskId> {
        critical_section::with(|cs| self.state.borrow(cs).get().task)
    }

    pub fn depth(&self) -> u8 {
        critical_section::with(|cs| self.state.borrow(cs).get().count)
    }
}

#[cfg(feature = "tasks")]
impl Default for TaskLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "tasks")]
impl core::fmt::Debug for TaskLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskLock")
            .field("holder", &self.holder())
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_lock_nests() {
        let lock = KernelLock::new();
        assert!(!lock.is_held());
        {
            let _outer = lock.enter();
            {
                let _inner = lock.enter();
                assert_eq!(lock.depth(), 2);
            }
            assert!(lock.is_held());
        }
        assert!(!lock.is_held());
    }

    #[cfg(feature = "tasks")]
    #[test]
    fn test_task_lock_reentrant_for_holder_only() {
        let lock = TaskLock::new();
        let a = TaskId::new(1, 0);
        let b = TaskId::new(2, 0);

        assert!(lock.try_enter(a));
        assert!(lock.try_enter(a));
        assert!(!lock.try_enter(b));
        assert_eq!(lock.depth(), 2);

        lock.leave();
        assert!(!lock.try_enter(b));
        lock.leave();
        assert_eq!(lock.holder(), None);
        assert!(lock.try_enter(b));
        assert_eq!(lock.holder(), Some(b));
    }

    #[cfg(feature = "tasks")]
    #[test]
    fn test_enter_as_holder_reenters_without_sleeping() {
        static LOCK: TaskLock = TaskLock::new();
        let me = TaskId::new(4, 0);
        let other = TaskId::new(5, 0);

        assert_eq!(LOCK.enter_as(me, |_| panic!("slept on a free lock")), Ok(()));
        assert_eq!(LOCK.enter_as(me, |_| panic!("holder slept")), Ok(()));
        assert_eq!(LOCK.depth(), 2);

        // Someone else has to sleep; a shutdown gets it out empty-handed.
        assert_eq!(LOCK.enter_as(other, |_| WAKE_SHUTDOWN), Err(WaitError::Shutdown));
        assert_eq!(LOCK.holder(), Some(me));
    }
}

//! Common error-handling support.
//!
//! Nothing in the kernel unwinds. Every recoverable failure is a value; only
//! scheduler invariant failures go through [`fatal`], which halts.

use core::fmt;

/// Errors from the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// No free block is large enough, even after coalescing.
    OutOfMemory { requested: usize },
    /// The pointer is misaligned, outside the heap, or names a reserved
    /// block.
    InvalidPointer,
    /// The block was already free.
    DoubleFree,
    /// Reserved ranges overlap, are unsorted, or leave a gap too small for
    /// a block header.
    InvalidLayout,
}

/// Errors from task management.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// The stack could not be allocated.
    OutOfMemory,
    /// Every TCB slot is in use.
    NoTaskSlot,
    /// Priority outside `PRIO_LOWEST..=PRIO_HIGHEST`.
    InvalidPriority(u8),
    /// Requested stack cannot hold the initial frame.
    StackTooSmall(usize),
    /// Stale or never-issued task handle.
    NoSuchTask,
    /// The operation would kill the idle task.
    IdleTask,
}

/// Why a blocking wait returned without the resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitError {
    /// The task was asked to shut down while waiting.
    Shutdown,
    /// The deadline passed first.
    TimedOut,
}

impl From<AllocError> for KernelError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfMemory { .. } => KernelError::OutOfMemory,
            // The scheduler only ever allocates, so the other variants
            // cannot come out of a launch.
            AllocError::InvalidPointer | AllocError::DoubleFree | AllocError::InvalidLayout => {
                KernelError::OutOfMemory
            }
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {} bytes", requested)
            }
            AllocError::InvalidPointer => f.write_str("pointer does not name a heap block"),
            AllocError::DoubleFree => f.write_str("block is already free"),
            AllocError::InvalidLayout => f.write_str("reserved ranges do not tile the heap"),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => f.write_str("out of memory for task stack"),
            KernelError::NoTaskSlot => f.write_str("task table full"),
            KernelError::InvalidPriority(p) => write!(f, "invalid priority {}", p),
            KernelError::StackTooSmall(s) => write!(f, "stack of {} bytes too small", s),
            KernelError::NoSuchTask => f.write_str("no such task"),
            KernelError::IdleTask => f.write_str("refusing to kill the idle task"),
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Shutdown => f.write_str("shutdown requested while waiting"),
            WaitError::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Halt on a broken scheduler invariant. Continuing would corrupt the task
/// rings beyond repair.
#[cold]
pub fn fatal(what: &'static str) -> ! {
    log::error!("kernel invariant violated: {}", what);
    panic!("kernel invariant violated: {}", what);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_error_converts_to_out_of_memory() {
        let e: KernelError = AllocError::OutOfMemory { requested: 64 }.into();
        assert_eq!(e, KernelError::OutOfMemory);
    }

    #[test]
    #[should_panic(expected = "idle task missing")]
    fn test_fatal_halts() {
        fatal("idle task missing");
    }
}

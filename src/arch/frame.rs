//! Saved-context layout.
//!
//! A task that is not running has its whole register state on its own stack,
//! in the order PendSV leaves it:
//!
//! ```text
//! sp ->  r4 r5 r6 r7 r8 r9 r10 r11     pushed by the PendSV handler
//!        r0 r1 r2 r3 r12 lr pc xpsr    pushed by exception entry
//! ```
//!
//! A freshly launched task gets a frame with exactly this shape, so the
//! first switch to it is an ordinary exception return. This module only
//! does the arithmetic; it compiles on any target so the scheduler can be
//! tested on the host.

use crate::config::WORD;

/// Registers saved by software (r4-r11).
pub const SW_WORDS: usize = 8;
/// Registers stacked by hardware on exception entry.
pub const HW_WORDS: usize = 8;
pub const FRAME_WORDS: usize = SW_WORDS + HW_WORDS;

// Slot offsets from the saved stack pointer.
pub const R0: usize = SW_WORDS;
pub const R1: usize = SW_WORDS + 1;
pub const R12: usize = SW_WORDS + 4;
pub const LR: usize = SW_WORDS + 5;
pub const PC: usize = SW_WORDS + 6;
pub const XPSR: usize = SW_WORDS + 7;

/// xPSR with only the Thumb bit set.
pub const XPSR_THUMB: usize = 0x0100_0000;

/// The smallest stack that can hold an initial frame after 8-byte
/// alignment of the top.
pub const MIN_STACK_BYTES: usize = FRAME_WORDS * WORD + 8;

/// Code addresses every frame needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vectors {
    /// Where a task lands when its entry function returns. Receives the
    /// return value in r0 and exits with it.
    pub task_return: usize,
    /// Entered with the exit code in r0. Used to force a task out.
    pub exit: usize,
}

// Exception return loads pc with bit 0 clear; the Thumb state lives in xPSR.
#[inline]
fn code_addr(a: usize) -> usize {
    a & !1
}

#[inline]
unsafe fn slot(sp: usize, i: usize) -> *mut usize {
    (sp as *mut usize).add(i)
}

/// Build the initial frame of a new task below `top` and return its saved
/// stack pointer.
///
/// # Safety
/// `[top - MIN_STACK_BYTES, top)` must be writable memory owned by the
/// caller.
pub unsafe fn init(
    top: usize,
    entry: usize,
    argc: usize,
    argv: usize,
    vectors: &Vectors,
) -> usize {
    let sp = (top & !7) - FRAME_WORDS * WORD;
    for i in 0..FRAME_WORDS {
        slot(sp, i).write(0);
    }
    slot(sp, R0).write(argc);
    slot(sp, R1).write(argv);
    slot(sp, LR).write(vectors.task_return);
    slot(sp, PC).write(code_addr(entry));
    slot(sp, XPSR).write(XPSR_THUMB);
    sp
}

/// Rewrite a saved frame so the task resumes in the exit path with `code`.
///
/// # Safety
/// `sp` must be the saved stack pointer of a task that is not running.
pub unsafe fn redirect_to_exit(sp: usize, vectors: &Vectors, code: i32) {
    slot(sp, R0).write(code as isize as usize);
    slot(sp, LR).write(vectors.task_return);
    slot(sp, PC).write(code_addr(vectors.exit));
    slot(sp, XPSR).write(XPSR_THUMB);
}

/// Read one saved register.
///
/// # Safety
/// `sp` must be a saved stack pointer and `i < FRAME_WORDS`.
pub unsafe fn get(sp: usize, i: usize) -> usize {
    slot(sp, i).read()
}

#[cfg(test)]
mod tests {
    use super::*;

    const V: Vectors = Vectors {
        task_return: 0x0800_1001,
        exit: 0x0800_2001,
    };

    #[test]
    fn test_initial_frame_looks_preempted() {
        let mut stack = [0xdeadusize; 64];
        let top = stack.as_mut_ptr() as usize + 64 * WORD;
        let sp = unsafe { init(top, 0x0800_4001, 2, 0x2000_0100, &V) };

        assert_eq!(sp % 8, 0);
        assert!(sp + FRAME_WORDS * WORD <= top);
        unsafe {
            assert_eq!(get(sp, 0), 0);
            assert_eq!(get(sp, R0), 2);
            assert_eq!(get(sp, R1), 0x2000_0100);
            assert_eq!(get(sp, R12), 0);
            assert_eq!(get(sp, LR), V.task_return);
            assert_eq!(get(sp, PC), 0x0800_4000);
            assert_eq!(get(sp, XPSR), XPSR_THUMB);
        }
    }

    #[test]
    fn test_redirect_to_exit_sets_code_and_pc() {
        let mut stack = [0usize; 32];
        let top = stack.as_mut_ptr() as usize + 32 * WORD;
        unsafe {
            let sp = init(top, 0x0800_4001, 0, 0, &V);
            redirect_to_exit(sp, &V, -1);
            assert_eq!(get(sp, PC), 0x0800_2000);
            assert_eq!(get(sp, R0) as isize, -1);
        }
    }
}

//! # ringkern Configuration
//!
//! Compile-time constants governing the scheduler, the heap and the
//! system timer. Subsystems are switched on and off with Cargo features
//! (`tasks`, `semaphores`); everything else is fixed here.

use core::mem::size_of;

/// Machine word size in bytes. The heap hands out memory in whole words.
pub const WORD: usize = size_of::<usize>();

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// SysTick frequency in Hz. One tick is one millisecond.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Default multitasking timeslice in ticks.
pub const DEFAULT_TIMESLICE: u8 = 20;

/// Timeslices at or below this many ticks are refused by
/// `Scheduler::set_timeslice`.
pub const MIN_TIMESLICE: u8 = 5;

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Maximum number of live tasks, idle task included. Bounds the TCB arena.
pub const MAX_TASKS: usize = 16;

/// Lowest priority a launched task may have.
pub const PRIO_LOWEST: u8 = 1;

/// Priority for ordinary application tasks.
pub const PRIO_NORMAL: u8 = 10;

/// Highest priority a launched task may have.
pub const PRIO_HIGHEST: u8 = 20;

/// Priority of the idle task, below anything a caller can launch.
pub const PRIO_IDLE: u8 = 0;

/// Number of distinct priority levels, idle level included. Bounds the
/// priority-chain arena.
pub const PRIORITY_LEVELS: usize = PRIO_HIGHEST as usize + 1;

/// Default stack size in bytes for a launched task.
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// Stack size of the idle task. It only has to hold an exception frame
/// plus whatever an interrupt handler stacks on top of it.
pub const IDLE_STACK_SIZE: usize = 256;

/// Exit code a task reports when it was killed.
pub const KILLED_EXIT_CODE: i32 = -1;

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

/// Words of per-block header: owner tag and data size.
pub const HEADER_WORDS: usize = 2;

/// A free block is split only if the remainder can hold a header plus
/// at least 8 bytes of data.
pub const SPLIT_THRESHOLD_WORDS: usize = HEADER_WORDS + (8 + WORD - 1) / WORD;

/// Size of the boot context's stack (ARM port), in words.
pub const BOOT_STACK_WORDS: usize = 256;

//! # ringkern
//!
//! The core of a small real-time kernel for ARM Cortex-M microcontrollers
//! without an MMU: a priority-ring scheduler, an owner-tagged heap that task
//! stacks and task allocations come from, and the synchronization they need.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   init · launch · start · wait_event · exit · kill     │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │   Heap             │  Sync             │
//! │  scheduler.rs│   heap.rs          │  semaphore.rs     │
//! │  ─ dispatch  │   ─ allocate       │  critsec.rs       │
//! │  ─ tick      │   ─ free           │  atomic.rs        │
//! │  ─ launch    │   ─ reclaim_all    │  wait.rs          │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │              Task Model (task.rs)                       │
//! │    TaskId · TCB · TaskState · TaskFlags · TaskSpec     │
//! ├────────────────────────────────────────────────────────┤
//! │     Arch Port (arch/frame.rs, arch/cortex_m4.rs)        │
//! │    PendSV · SysTick · saved frames · trampolines       │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! Tasks at the same priority share a circular ring and run round-robin,
//! one timeslice each. A lower priority level only runs when nothing above
//! it is ready. Blocking is done with wake conditions that the dispatcher
//! polls, so there are no wait queues. An idle task at priority 0 keeps the
//! scan from ever coming up empty.
//!
//! ## Memory Model
//!
//! - **One heap**: a caller-provided `'static` word region
//! - **Owner tags**: each block remembers its task; exiting user tasks have
//!   their blocks reclaimed in one pass
//! - **Fixed arenas**: TCBs and priority chains live inside the scheduler
//! - **Critical sections**: `critical-section` for short scheduler edits,
//!   the kernel lock for heap walks
//!
//! Everything except `arch::cortex_m4` and `kernel` builds on the host, and
//! the unit tests run there.
//!
//! ## Without `tasks`
//!
//! Building with `--no-default-features` drops the scheduler. `kernel` is
//! then the single-task layer in `single.rs`: one global heap with eager
//! coalescing and every block owned by the single context.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod atomic;
pub mod config;
pub mod critsec;
pub mod err;
pub mod heap;
#[cfg(all(feature = "tasks", target_arch = "arm", target_os = "none"))]
pub mod kernel;
#[cfg(feature = "tasks")]
pub mod scheduler;
#[cfg(feature = "semaphores")]
pub mod semaphore;
#[cfg(not(feature = "tasks"))]
pub mod single;
#[cfg(not(feature = "tasks"))]
pub use single as kernel;
pub mod sync;
pub mod task;
pub mod time;
#[cfg(feature = "tasks")]
pub mod wait;

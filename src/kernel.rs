//! # Kernel
//!
//! The single kernel instance and the API tasks call.
//!
//! The kernel owns the heap and the scheduler, each in its own static so the
//! tick handler can reach the scheduler without aliasing the heap. Short
//! edits of scheduler state from task context run with interrupts masked;
//! heap walks run under the kernel lock instead, which keeps interrupts alive
//! and only holds off task switches.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()    ← SysTick, heap, idle task
//!         ├─► kernel::launch()  ← Register tasks (×N)
//!         └─► kernel::start()   ← No return
//!               ├─► Move the boot context onto its process stack
//!               ├─► Yield to the first task
//!               └─► When every task has exited: run `after`
//! ```

use core::cell::Cell;
use core::ptr::{self, addr_of_mut, NonNull};

use critical_section::Mutex;

use crate::arch::cortex_m4;
use crate::arch::frame::Vectors;
use crate::config::{BOOT_STACK_WORDS, IDLE_STACK_SIZE, KILLED_EXIT_CODE};
use crate::critsec::KernelLock;
use crate::err::{fatal, AllocError, KernelError};
use crate::heap::{FreePolicy, Heap, Owner};
use crate::scheduler::{Block, KillOutcome, Mode, Scheduler};
use crate::sync;
use crate::task::{TaskEntry, TaskFlags, TaskId, TaskKind, TaskSpec};
use crate::time::Timestamp;
use crate::wait::WaitCondition;

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

static mut HEAP: Option<Heap<'static>> = None;
static mut SCHED: Option<Scheduler> = None;

/// Set once by `init`, read from the exception handlers.
static mut HEAP_PTR: *mut Heap<'static> = ptr::null_mut();
static mut SCHED_PTR: *mut Scheduler = ptr::null_mut();

/// The kernel critical-section counter.
pub static KERNEL_LOCK: KernelLock = KernelLock::new();

#[repr(C, align(8))]
struct BootStack([usize; BOOT_STACK_WORDS]);

static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_WORDS]);

static AFTER: Mutex<Cell<Option<fn() -> !>>> = Mutex::new(Cell::new(None));

/// The scheduler. Task code only touches it with interrupts masked; SysTick
/// and PendSV share one priority and never preempt each other.
fn sched() -> &'static mut Scheduler {
    // SAFETY: SCHED_PTR is written once in `init` before any handler can
    // run, and every caller is serialized as described above.
    match unsafe { SCHED_PTR.as_mut() } {
        Some(s) => s,
        None => fatal("kernel used before init"),
    }
}

/// The heap. Task code only touches it under the kernel lock or with
/// interrupts masked; PendSV backs off while the lock is held and SysTick
/// never touches it.
fn heap() -> &'static mut Heap<'static> {
    // SAFETY: as for `sched`.
    match unsafe { HEAP_PTR.as_mut() } {
        Some(h) => h,
        None => fatal("kernel used before init"),
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

extern "C" fn idle_task(_argc: usize, _argv: *const *const u8) -> i32 {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Initialize the kernel over `heap` and launch the idle task.
///
/// Configures SysTick so the clock runs from here on. Must be called
/// exactly once, from `main`, before anything else in this module.
pub fn init(cp: &mut cortex_m::Peripherals, heap: &'static mut [usize]) -> Result<(), KernelError> {
    let vectors = Vectors {
        task_return: cortex_m4::task_return as usize,
        exit: cortex_m4::task_exit as usize,
    };
    let mut h = Heap::new(heap, FreePolicy::Deferred);
    let mut s = Scheduler::new(vectors);
    s.launch(&mut h, &TaskSpec::idle(idle_task, IDLE_STACK_SIZE))?;
    log::debug!("kernel heap at {:#x}, {} bytes", h.base_addr(), h.capacity());

    // SAFETY: single-threaded, no handler runs before SysTick is enabled.
    unsafe {
        let slot = &mut *addr_of_mut!(HEAP);
        HEAP_PTR = slot.insert(h) as *mut Heap<'static>;
        let slot = &mut *addr_of_mut!(SCHED);
        SCHED_PTR = slot.insert(s) as *mut Scheduler;
    }

    cortex_m4::set_interrupt_priorities(&mut cp.SCB);
    cortex_m4::configure_systick(&mut cp.SYST);
    Ok(())
}

extern "C" fn boot_context() -> ! {
    yield_now();
    // Resumed only once every task has exited.
    log::debug!("all tasks finished");
    match sync::critical_section(|cs| AFTER.borrow(cs).get()) {
        Some(after) => after(),
        None => loop {
            cortex_m::asm::wfi();
        },
    }
}

/// Start multitasking. **Does not return.**
///
/// Launched tasks start running right away. When the last of them has
/// exited the kernel falls back to single-task mode and calls `after` on
/// the boot stack.
pub fn start(after: fn() -> !) -> ! {
    sync::critical_section(|cs| {
        AFTER.borrow(cs).set(Some(after));
        sched().start();
    });

    // SAFETY: called once from main on the main stack; the boot stack is
    // used by nothing else.
    unsafe {
        let stack = &mut *addr_of_mut!(BOOT_STACK);
        let top = stack.0.as_mut_ptr().add(BOOT_STACK_WORDS) as usize;
        cortex_m4::enter_process_stack(top, boot_context)
    }
}

// ---------------------------------------------------------------------------
// Exception entry points
// ---------------------------------------------------------------------------

/// Called from PendSV with the outgoing process stack pointer.
pub(crate) fn switch_context(psp: usize) -> usize {
    if KERNEL_LOCK.is_held() {
        return psp;
    }
    sched().dispatch(heap(), psp)
}

/// Called from SysTick. Returns whether to switch.
pub(crate) fn on_tick() -> bool {
    sched().tick(KERNEL_LOCK.is_held())
}

// ---------------------------------------------------------------------------
// Task API
// ---------------------------------------------------------------------------

/// Launch a task running `entry(argc, argv)`.
///
/// Entry points inside the kernel image (below the heap) make kernel tasks,
/// whose heap blocks survive their exit; anything else is a user task.
pub fn launch(
    entry: TaskEntry,
    argc: usize,
    argv: *const *const u8,
    priority: u8,
    stack_size: usize,
) -> Result<TaskId, KernelError> {
    let base = sync::critical_section(|_| heap().base_addr());
    let kind = if (entry as usize) < base {
        TaskKind::Kernel
    } else {
        TaskKind::User
    };
    let spec = TaskSpec::new(entry)
        .args(argc, argv)
        .priority(priority)
        .stack_size(stack_size)
        .kind(kind);
    launch_spec(&spec)
}

/// Launch a task with an explicit kind.
pub fn launch_spec(spec: &TaskSpec) -> Result<TaskId, KernelError> {
    let _lock = KERNEL_LOCK.enter();
    sync::critical_section(|_| sched().launch(heap(), spec))
}

/// Give up the rest of the timeslice.
pub fn yield_now() {
    // Before `start` thread mode is still on the main stack; there is
    // nothing to switch to anyway.
    if sync::critical_section(|_| sched().mode()) == Mode::Multi {
        cortex_m4::set_pendsv();
    }
}

/// Sleep until `cond` fires and return its wake value. Returns 0 at once,
/// or later, if the task is asked to shut down.
pub fn wait_event(cond: WaitCondition) -> u32 {
    match sync::critical_section(|_| sched().block_current(cond)) {
        Block::Immediate(v) => v,
        Block::Polling => loop {
            let now = self::now();
            match cond.poll(now, TaskId::BOOT) {
                0 => cortex_m::asm::wfi(),
                v => return v,
            }
        },
        Block::Blocked => loop {
            yield_now();
            if let Some(v) = sync::critical_section(|_| sched().take_wake_value()) {
                return v;
            }
        },
    }
}

/// Sleep for `ms` milliseconds. Returns the milliseconds left if a shutdown
/// request cut the sleep short, else 0.
pub fn msleep(ms: u32) -> u32 {
    let deadline = now().after_ms(ms);
    wait_event(WaitCondition::Until(deadline));
    deadline.ms_after(now())
}

/// Sleep for `s` seconds. Returns the seconds left, rounded up.
pub fn sleep(s: u32) -> u32 {
    msleep(s.saturating_mul(1000)).div_ceil(1000)
}

/// Terminate the calling task with `code`.
///
/// Frees everything the task allocated unless it is a kernel task. The
/// task's stack goes when the scheduler reaps it.
pub fn exit(code: i32) -> ! {
    // SAFETY: exit never runs inside a critical section it would break.
    unsafe { cortex_m::interrupt::enable() };

    if sync::critical_section(|_| sched().mode()) == Mode::Single {
        fatal("exit from the boot context");
    }
    sync::critical_section(|_| sched().exit_current(heap(), code));
    loop {
        yield_now();
    }
}

/// Kill a task. Killing yourself is `exit(-1)`.
pub fn kill(target: TaskId) -> Result<(), KernelError> {
    match sync::critical_section(|_| sched().kill(target))? {
        KillOutcome::SelfExit => exit(KILLED_EXIT_CODE),
        KillOutcome::Redirected => Ok(()),
    }
}

/// Kill every task at or below `priority` except the caller and idle.
pub fn killall(priority: u8) -> usize {
    sync::critical_section(|_| sched().killall(priority))
}

pub fn shutdown_task(target: TaskId) -> Result<(), KernelError> {
    sync::critical_section(|_| sched().shutdown_task(target))
}

pub fn shutdown_tasks(flags: TaskFlags) -> usize {
    sync::critical_section(|_| sched().shutdown_tasks(flags))
}

pub fn shutdown_requested() -> bool {
    sync::critical_section(|_| sched().shutdown_requested())
}

pub fn set_timeslice(ms: u32) -> bool {
    sync::critical_section(|_| sched().set_timeslice(ms))
}

pub fn current() -> TaskId {
    sync::critical_section(|_| sched().current())
}

pub fn now() -> Timestamp {
    sync::critical_section(|_| sched().now())
}

pub fn task_count() -> usize {
    sync::critical_section(|_| sched().task_count())
}

pub fn kernel_task_count() -> usize {
    sync::critical_section(|_| sched().kernel_task_count())
}

pub fn user_tasks_running() -> bool {
    sync::critical_section(|_| sched().user_tasks_running())
}

// ---------------------------------------------------------------------------
// Heap API
// ---------------------------------------------------------------------------

fn owner() -> Owner {
    sync::critical_section(|_| sched().current_owner())
}

/// Allocate `size` bytes owned by the calling task.
pub fn malloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    let owner = owner();
    let _lock = KERNEL_LOCK.enter();
    heap().allocate(size, owner)
}

/// Allocate `count * size` zeroed bytes owned by the calling task.
pub fn calloc(count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    let owner = owner();
    let _lock = KERNEL_LOCK.enter();
    heap().allocate_zeroed(count, size, owner)
}

pub fn free(ptr: *mut u8) -> Result<(), AllocError> {
    let _lock = KERNEL_LOCK.enter();
    heap().free(ptr)
}

pub fn free_bytes() -> usize {
    let _lock = KERNEL_LOCK.enter();
    heap().free_bytes()
}

pub fn defragment() {
    let _lock = KERNEL_LOCK.enter();
    heap().defragment();
}

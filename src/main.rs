//! # ringkern Example Firmware
//!
//! A handful of tasks exercising the scheduler and semaphores:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `consumer` | 10 | Waits on `ITEMS` until it has seen `ITEM_COUNT` items |
//! | `producer` | 8 | Posts `ITEMS` every 50 ms, then returns |
//! | `spinner` | 3 | User task; allocates, busy-loops until asked to shut down |
//! | `watchdog` | 12 | Sleeps one second, then shuts down all user tasks |
//!
//! Once every task has exited the kernel falls back to the boot context,
//! which parks the CPU.

#![no_std]
#![no_main]

use core::ptr::addr_of_mut;

use cortex_m_rt::entry;
use panic_halt as _;

use ringkern::config::DEFAULT_STACK_SIZE;
use ringkern::kernel;
use ringkern::semaphore::Semaphore;
use ringkern::task::{TaskFlags, TaskKind, TaskSpec};

const ITEM_COUNT: i32 = 10;

static ITEMS: Semaphore = Semaphore::new(0);

static mut HEAP: [usize; 4096] = [0; 4096];

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

extern "C" fn producer(_argc: usize, _argv: *const *const u8) -> i32 {
    for _ in 0..ITEM_COUNT {
        if kernel::msleep(50) != 0 {
            return 1;
        }
        ITEMS.post();
    }
    0
}

extern "C" fn consumer(_argc: usize, _argv: *const *const u8) -> i32 {
    let mut seen = 0;
    while seen < ITEM_COUNT {
        if ITEMS.wait().is_err() {
            break;
        }
        seen += 1;
    }
    seen
}

/// Burns CPU at low priority. Its scratch buffer is reclaimed when it exits.
extern "C" fn spinner(_argc: usize, _argv: *const *const u8) -> i32 {
    let scratch = match kernel::calloc(16, 4) {
        Ok(p) => p.as_ptr(),
        Err(_) => return 1,
    };
    let mut n: u8 = 0;
    while !kernel::shutdown_requested() {
        n = n.wrapping_add(1);
        // SAFETY: `scratch` holds 64 bytes.
        unsafe { scratch.add(n as usize % 64).write(n) };
    }
    0
}

extern "C" fn watchdog(_argc: usize, _argv: *const *const u8) -> i32 {
    kernel::sleep(1);
    kernel::shutdown_tasks(TaskFlags::USER) as i32
}

fn after() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();

    // SAFETY: `HEAP` is handed to the kernel once and never touched again.
    let heap = unsafe { &mut *addr_of_mut!(HEAP) };
    kernel::init(&mut cp, heap).expect("no memory for the idle task");

    kernel::launch(consumer, 0, core::ptr::null(), 10, DEFAULT_STACK_SIZE)
        .expect("failed to launch consumer");
    kernel::launch(producer, 0, core::ptr::null(), 8, DEFAULT_STACK_SIZE)
        .expect("failed to launch producer");
    kernel::launch(watchdog, 0, core::ptr::null(), 12, 512).expect("failed to launch watchdog");
    kernel::launch_spec(
        &TaskSpec::new(spinner)
            .priority(3)
            .stack_size(512)
            .kind(TaskKind::User),
    )
    .expect("failed to launch spinner");

    kernel::start(after)
}

//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor:
//! exception handlers, SysTick setup, and the trampolines that saved frames
//! point at.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by tasks and, after
//!   `kernel::start`, by the boot context
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. PendSV pushes R4–R11 below that, hands the resulting
//! stack pointer to the scheduler, and unstacks whatever stack pointer comes
//! back. The layout is described in [`super::frame`].
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both run at the lowest priority, so neither preempts
//! the other and the scheduler never re-enters itself.
//!
//! Only integer state is switched; build for `thumbv7em-none-eabi`.

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // SAFETY: lowering the priority of the two kernel exceptions cannot
    // break any priority-based critical section.
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Request a context switch. Taken as soon as no other exception is active
/// and interrupts are enabled.
#[inline]
pub fn set_pendsv() {
    SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

// ---------------------------------------------------------------------------
// Boot context
// ---------------------------------------------------------------------------

/// Move thread mode onto the process stack at `top` and jump to `entry`.
///
/// # Safety
/// `top` must be the 8-byte aligned end of a stack nobody else uses, and
/// this must run in thread mode on the main stack.
pub unsafe fn enter_process_stack(top: usize, entry: extern "C" fn() -> !) -> ! {
    asm!(
        "msr psp, {top}",
        "msr control, {ctl}",
        "isb",
        "bx {entry}",
        top = in(reg) top,
        ctl = in(reg) 2u32,
        entry = in(reg) entry,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// Frame trampolines
// ---------------------------------------------------------------------------

/// A task's entry function returned here with its result in r0.
pub extern "C" fn task_return(code: i32) -> ! {
    log::trace!("task returned {}", code);
    kernel::exit(code)
}

/// Entered by tasks whose frame was redirected by a kill.
pub extern "C" fn task_exit(code: i32) -> ! {
    kernel::exit(code)
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler.
///
/// Naked so the compiler does not touch r4-r11 before they are saved. r1
/// is pushed next to lr only to keep MSP 8-byte aligned across the call.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "push {{r1, lr}}",
        "bl {switch}",
        "pop {{r1, lr}}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        // Return to thread mode on the process stack.
        "mov lr, #0xFFFFFFFD",
        "bx lr",
        switch = sym switch_context,
    );
}

extern "C" fn switch_context(psp: usize) -> usize {
    kernel::switch_context(psp)
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn SysTick() {
    if kernel::on_tick() {
        set_pendsv();
    }
}

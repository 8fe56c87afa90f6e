//! # Synchronization Primitives
//!
//! Interrupt masking for short edits of shared scheduler state. Task code
//! that touches the scheduler (blocking, exiting, killing) does so inside
//! [`critical_section`] so the SysTick and PendSV handlers never observe a
//! half-updated ring.
//!
//! Long operations (heap walks) use the kernel lock in `critsec` instead,
//! which keeps interrupts enabled and only defers task switches.

/// Execute a closure with interrupts masked.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared state safely
/// });
/// ```
///
/// Keep the closure short: it adds directly to interrupt latency.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(critical_section::CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

//! Interrupt-masked single-byte counter.
//!
//! This is the leaf primitive the rest of the kernel builds on: the kernel
//! critical-section counter and the semaphore count are both an
//! `AtomicCounter`. Every access runs with interrupts masked through the
//! `critical-section` crate. On Cortex-M with `critical-section-single-core`
//! that masks everything except NMI and HardFault.

use core::cell::Cell;

use critical_section::Mutex;

pub struct AtomicCounter {
    value: Mutex<Cell<u8>>,
}

impl AtomicCounter {
    pub const fn new(value: u8) -> Self {
        Self {
            value: Mutex::new(Cell::new(value)),
        }
    }

    pub fn get(&self) -> u8 {
        critical_section::with(|cs| self.value.borrow(cs).get())
    }

    pub fn set(&self, value: u8) {
        critical_section::with(|cs| self.value.borrow(cs).set(value));
    }

    /// Increment, wrapping at 255. Returns the new value.
    pub fn increment(&self) -> u8 {
        critical_section::with(|cs| {
            let cell = self.value.borrow(cs);
            let v = cell.get().wrapping_add(1);
            cell.set(v);
            v
        })
    }

    /// Increment unless the counter is already at 255. Returns whether it
    /// did.
    pub fn try_increment(&self) -> bool {
        critical_section::with(|cs| {
            let cell = self.value.borrow(cs);
            match cell.get().checked_add(1) {
                Some(v) => {
                    cell.set(v);
                    true
                }
                None => false,
            }
        })
    }

    /// Decrement, wrapping at 0. Returns the new value.
    pub fn decrement(&self) -> u8 {
        critical_section::with(|cs| {
            let cell = self.value.borrow(cs);
            let v = cell.get().wrapping_sub(1);
            cell.set(v);
            v
        })
    }

    /// Decrement only if the counter is positive. Returns whether it did.
    pub fn try_decrement(&self) -> bool {
        critical_section::with(|cs| {
            let cell = self.value.borrow(cs);
            match cell.get() {
                0 => false,
                v => {
                    cell.set(v - 1);
                    true
                }
            }
        })
    }
}

//! # Architecture Abstraction Layer
//!
//! `frame` is plain arithmetic on saved register frames and builds
//! everywhere. The Cortex-M4 port (exception handlers, SysTick, boot-stack
//! entry) only exists on bare-metal ARM.

pub mod frame;

#[cfg(all(feature = "tasks", target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

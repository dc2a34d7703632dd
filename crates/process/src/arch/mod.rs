//! Per-CPU state the scheduler installs on every switch.
//!
//! Tests and the `software-emulation` feature record the values instead of
//! writing them to the hardware.

use mm::VirtualAddress;

// NOTE: The x86_64 module is compiled during tests too so rust-analyzer sees it.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::{HardwareProcessor, without_interrupts};

#[cfg(any(test, feature = "software-emulation"))]
mod emulated;
#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::{EmulatedProcessor, ProcessorState, without_interrupts};

pub trait Processor {
    /// Sets the stack the CPU switches to when ring 3 is interrupted.
    fn set_kernel_stack(&mut self, top: VirtualAddress);

    /// Sets the thread-local storage base.
    fn set_thread_pointer(&mut self, base: VirtualAddress);
}

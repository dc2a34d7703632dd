#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Process Core
//!
//! Tasks and everything that moves them between states on a single CPU:
//!
//! - A fixed table of control blocks. The first slots hold cooperative kernel
//!   tasks, the rest preemptive kernel threads and user processes.
//! - A priority scheduler with per-task time slices, run on every timer tick
//!   and system call return.
//! - Fork and thread creation, with copy-on-write address spaces.
//! - POSIX-style signals: dispositions, masks, alarms, and delivery onto the
//!   user stack through a trampoline.
//! - Process groups and sessions.
//!
//! Memory comes from the `mm` crate. Tests, and builds with the
//! `software-emulation` feature, run on emulated memory and an emulated CPU.

extern crate alloc;

mod address_space;
mod arch;
pub mod config;
mod context;
mod error;
mod files;
mod fork;
mod global;
mod groups;
mod kernel;
mod lifecycle;
mod scheduler;
mod signal;
mod table;
mod task;

#[cfg(test)]
mod testing;

pub use address_space::{AddressSpace, UserSpace};
pub use context::{
    FramePointer, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, KernelStack, SavedContext,
    USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};
pub use error::TaskError;
pub use files::{FileDescriptor, FileTable, IpcHooks, NoIpc, PipeEnd};
pub use fork::CloneFlags;
pub use global::{install, on_interrupt_return, with_kernel};
pub use kernel::{Kernel, KernelConfig};
pub use lifecycle::{WaitOptions, WaitTarget};
pub use signal::{
    DefaultAction, Delivery, Disposition, MaskHow, SIGNAL_FRAME_SIZE, Signal, SignalContext,
    SignalSet, SignalState,
};
pub use task::{ExitStatus, Mode, Pid, Priority, Slot, Task, TaskInfo, TaskState};

pub use arch::{Processor, without_interrupts};

#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use arch::HardwareProcessor;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedProcessor, ProcessorState};

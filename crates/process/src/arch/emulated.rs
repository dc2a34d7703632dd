use alloc::sync::Arc;

use mm::VirtualAddress;
use spin::Mutex;

use super::Processor;

/// What the emulated CPU has been told so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorState {
    pub kernel_stack: Option<VirtualAddress>,
    pub thread_pointer: Option<VirtualAddress>,
    /// Number of kernel stack installs.
    pub stack_switches: usize,
}

/// Records the per-CPU state instead of loading it. Clones share the record,
/// so a test can keep one while the kernel owns another.
#[derive(Clone, Default)]
pub struct EmulatedProcessor {
    state: Arc<Mutex<ProcessorState>>,
}

impl EmulatedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock()
    }
}

impl Processor for EmulatedProcessor {
    fn set_kernel_stack(&mut self, top: VirtualAddress) {
        let mut state = self.state.lock();
        state.kernel_stack = Some(top);
        state.stack_switches += 1;
    }

    fn set_thread_pointer(&mut self, base: VirtualAddress) {
        self.state.lock().thread_pointer = Some(base);
    }
}

/// There are no interrupts to mask in emulation.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

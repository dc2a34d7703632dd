use mm::VirtualAddress;
use x86_64::{
    VirtAddr, instructions::interrupts, registers::model_specific::FsBase,
    structures::tss::TaskStateSegment,
};

use super::Processor;

/// Installs kernel stacks into the TSS and thread pointers into `FS_BASE`.
pub struct HardwareProcessor {
    tss: &'static mut TaskStateSegment,
}

impl HardwareProcessor {
    /// # Safety
    ///
    /// `tss` must be the segment loaded on this CPU, and nothing else may write
    /// its privilege stack table.
    pub unsafe fn new(tss: &'static mut TaskStateSegment) -> Self {
        Self { tss }
    }
}

impl Processor for HardwareProcessor {
    fn set_kernel_stack(&mut self, top: VirtualAddress) {
        self.tss.privilege_stack_table[0] = VirtAddr::new(top.as_u64());
    }

    fn set_thread_pointer(&mut self, base: VirtualAddress) {
        FsBase::write(VirtAddr::new(base.as_u64()));
    }
}

/// Runs `f` with maskable interrupts disabled, restoring the previous state.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    interrupts::without_interrupts(f)
}

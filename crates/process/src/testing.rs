//! A kernel over emulated memory, for unit tests.

use alloc::boxed::Box;

use mm::{AddressSpaceMapper, AddressTranslator, FrameTable, PAGE_SIZE, PhysicalAddress, VirtualAddress};

use crate::{
    EmulatedProcessor, FramePointer, Kernel, KernelConfig, KernelStack, NoIpc, SavedContext, Slot,
};

const MEMORY_FRAMES: usize = 1024;

/// Entry point given to test tasks. Never executed.
pub(crate) const ENTRY: usize = 0x0040_1000;
pub(crate) const TRAMPOLINE: usize = 0x0040_0000;
pub(crate) const THREAD_EXIT: usize = 0x8000;

pub(crate) struct Harness {
    pub kernel: Kernel,
    /// Shares its record with the processor the kernel owns.
    pub cpu: EmulatedProcessor,
    /// The frame the boot task was interrupted with.
    pub boot: FramePointer,
}

pub(crate) fn harness() -> Harness {
    AddressTranslator::set_current(AddressTranslator::emulated(MEMORY_FRAMES * PAGE_SIZE));
    let mut frames = FrameTable::new(PhysicalAddress::new(0), MEMORY_FRAMES);
    frames.reserve(PhysicalAddress::new(0));
    let mapper = AddressSpaceMapper::bootstrap(&mut frames, PhysicalAddress::new(64 * PAGE_SIZE))
        .unwrap();
    // SAFETY: the emulated MMU only records which root is loaded.
    unsafe { mapper.kernel_directory().activate() };

    let stack = KernelStack::allocate(&mut frames).unwrap();
    let boot = stack.push_context(
        SavedContext::kernel(VirtualAddress::new(ENTRY), stack.top()),
        stack.top(),
    );

    let cpu = EmulatedProcessor::new();
    let config = KernelConfig::new(VirtualAddress::new(TRAMPOLINE), VirtualAddress::new(THREAD_EXIT));
    let kernel = Kernel::new(
        config,
        Box::new(frames),
        mapper,
        Box::new(cpu.clone()),
        Box::new(NoIpc),
    );
    Harness { kernel, cpu, boot }
}

pub(crate) fn spawn_user(h: &mut Harness) -> Slot {
    let pid = h
        .kernel
        .create_user_thread("user", VirtualAddress::new(ENTRY), true)
        .unwrap();
    h.kernel.find_pid(pid).unwrap()
}

pub(crate) fn spawn_kernel(h: &mut Harness) -> Slot {
    let pid = h
        .kernel
        .create_thread("kthread", VirtualAddress::new(ENTRY), true)
        .unwrap();
    h.kernel.find_pid(pid).unwrap()
}

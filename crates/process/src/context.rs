//! Saved register frames and the kernel stacks that hold them.
//!
//! Every interrupt and system call entry pushes a [`SavedContext`] onto the
//! current kernel stack and hands its address to the core as a [`FramePointer`].
//! The interrupt return path pops whatever frame the core hands back, so
//! switching tasks, forking and entering a new thread all come down to building
//! the right `SavedContext` on the right stack.

use core::mem::size_of;

use mm::{FrameAllocator, PAGE_SIZE, PhysicalAddress, VirtualAddress};

use crate::TaskError;

pub const KERNEL_CODE_SELECTOR: u64 = 0x08;
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;
pub const USER_DATA_SELECTOR: u64 = 0x1b;
pub const USER_CODE_SELECTOR: u64 = 0x23;

/// Interrupts enabled, reserved bit 1 set.
pub const DEFAULT_RFLAGS: u64 = 0x202;

const RFLAGS_INTERRUPT_ENABLE: u64 = 1 << 9;
const RFLAGS_IOPL: u64 = 0b11 << 12;

/// Registers in the order the entry stubs push them, lowest address first.
///
/// The tail from `rip` onwards is the frame the CPU itself pushes, so `iretq`
/// resumes from it directly once the stub has popped everything before it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavedContext {
    pub gs: u64,
    pub fs: u64,
    pub es: u64,
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl SavedContext {
    /// A ring-0 frame that starts executing `entry` on `stack`.
    pub fn kernel(entry: VirtualAddress, stack: VirtualAddress) -> Self {
        Self::with_selectors(entry, stack, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR)
    }

    /// A ring-3 frame that starts executing `entry` on the user stack `stack`.
    pub fn user(entry: VirtualAddress, stack: VirtualAddress) -> Self {
        Self::with_selectors(entry, stack, USER_CODE_SELECTOR, USER_DATA_SELECTOR)
    }

    fn with_selectors(entry: VirtualAddress, stack: VirtualAddress, code: u64, data: u64) -> Self {
        Self {
            gs: data,
            fs: data,
            es: data,
            ds: data,
            rip: entry.as_u64(),
            cs: code,
            rflags: DEFAULT_RFLAGS,
            rsp: stack.as_u64(),
            ss: data,
            ..Self::default()
        }
    }

    /// True if the frame returns to ring 3.
    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    pub fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    /// Sets the value the interrupted code sees as the result of its system call.
    pub fn set_return_value(&mut self, value: u64) {
        self.rax = value;
    }

    /// Forces the selectors and flags back to what ring 3 is allowed to run with.
    pub fn sanitize_user(&mut self) {
        self.cs = USER_CODE_SELECTOR;
        self.ss = USER_DATA_SELECTOR;
        self.rflags = (self.rflags & !RFLAGS_IOPL) | RFLAGS_INTERRUPT_ENABLE;
    }
}

/// The address of a [`SavedContext`] on some kernel stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePointer(VirtualAddress);

impl FramePointer {
    /// # Safety
    ///
    /// `addr` must point at a `SavedContext` that stays valid, and is not
    /// otherwise referenced, for as long as the pointer is used.
    pub const unsafe fn new(addr: VirtualAddress) -> Self {
        Self(addr)
    }

    pub fn address(self) -> VirtualAddress {
        self.0
    }

    /// # Safety
    ///
    /// No other reference to the frame may be live while the returned one is.
    pub unsafe fn context<'a>(self) -> &'a mut SavedContext {
        // SAFETY: the frame is valid per `new`, exclusivity per the caller.
        unsafe { &mut *self.0.as_mut_ptr::<SavedContext>() }
    }
}

/// A one-frame kernel stack, reached through the direct map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    base: PhysicalAddress,
}

impl KernelStack {
    pub fn allocate(frames: &mut dyn FrameAllocator) -> Result<Self, TaskError> {
        let base = frames.allocate_frame().ok_or(TaskError::OutOfFrames)?;
        Ok(Self { base })
    }

    pub fn base(self) -> PhysicalAddress {
        self.base
    }

    fn bottom(self) -> usize {
        VirtualAddress::direct_mapped(self.base).as_usize()
    }

    /// The initial stack pointer: one past the highest byte of the stack.
    pub fn top(self) -> VirtualAddress {
        // SAFETY: offsets within or just past a direct-mapped frame are as valid
        // as the frame's own address. Emulated ones are host pointers.
        unsafe { VirtualAddress::new_unchecked(self.bottom() + PAGE_SIZE) }
    }

    /// Writes `value` into the topmost eight bytes, where a function entered
    /// with the stack pointer at `top() - 8` finds its return address.
    pub fn push_return_address(self, value: VirtualAddress) -> VirtualAddress {
        let slot = self.top().as_usize() - size_of::<u64>();
        // SAFETY: the slot lies inside this stack's frame and is 8-byte aligned.
        unsafe {
            (slot as *mut u64).write(value.as_u64());
            VirtualAddress::new_unchecked(slot)
        }
    }

    /// Places `context` just below `below` and returns a pointer to it.
    pub fn push_context(self, context: SavedContext, below: VirtualAddress) -> FramePointer {
        let addr = (below.as_usize() - size_of::<SavedContext>()) & !15;
        debug_assert!(addr >= self.bottom());
        // SAFETY: the frame lies inside this stack, which nothing else uses yet.
        unsafe {
            (addr as *mut SavedContext).write(context);
            FramePointer::new(VirtualAddress::new_unchecked(addr))
        }
    }

    pub fn free(self, frames: &mut dyn FrameAllocator) {
        frames.free_frame(self.base);
    }
}

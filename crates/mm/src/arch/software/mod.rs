//! Host-side model of x86_64 paging.
//!
//! The model keeps the x86_64 entry format and 4 KiB pages but uses three levels
//! (a 39-bit address space), so a whole address space fits in a few frames of
//! emulated memory. Translation-cache operations are recorded per thread instead of
//! executed, which lets tests observe exactly what a change invalidated.

mod entry;
mod flags;
mod table;

use core::cell::Cell;
use core::ptr::NonNull;

use std::alloc::{Layout, alloc_zeroed, dealloc};

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

use crate::{PhysicalAddress, VirtualAddress};

pub const MAX_PHYSICAL_BITS: usize = 32;

pub const MAX_VIRTUAL_BITS: usize = 39;

pub const PAGE_SIZE: usize = 4096;

/// Levels 2 (root), 1 and 0 (leaf).
pub const PAGE_TABLE_LEVELS: usize = 3;

pub const ENTRY_COUNT: usize = 512;

/// First address of the kernel half.
pub const USER_SPACE_END: usize = 1 << (MAX_VIRTUAL_BITS - 1);

#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(
        level < PAGE_TABLE_LEVELS,
        "level out of range for software emulation (0-2)"
    );
    (address >> (12 + level * 9)) & (ENTRY_COUNT - 1)
}

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Virtual addresses must be sign-extended from bit 38.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let upper = addr >> (MAX_VIRTUAL_BITS - 1);
    upper == 0 || upper == usize::MAX >> (MAX_VIRTUAL_BITS - 1)
}

/// Emulated physical memory.
///
/// The buffer is page-aligned so page tables and register frames placed in it have
/// the same alignment they would have in real memory.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is owned exclusively by this value and only reached through
// raw pointers whose users synchronize access themselves.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// # Panics
    ///
    /// Panics if the host cannot provide the buffer.
    pub fn new(size: usize) -> Self {
        let size = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let layout = Layout::from_size_align(size, PAGE_SIZE).expect("invalid emulated memory size");
        // SAFETY: the layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).expect("host allocation for emulated memory failed");
        Self { base, layout }
    }

    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size(), "pointer not within emulated memory");
        offset
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Translation-cache operations observed on the current thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmuCounters {
    /// Single-address invalidations.
    pub invalidations: usize,
    /// Full flushes not caused by a directory load.
    pub flushes: usize,
    /// Directory loads.
    pub loads: usize,
}

std::thread_local! {
    static ACTIVE_ROOT: Cell<Option<PhysicalAddress>> = const { Cell::new(None) };
    static COUNTERS: Cell<MmuCounters> = const {
        Cell::new(MmuCounters { invalidations: 0, flushes: 0, loads: 0 })
    };
}

fn record(update: impl FnOnce(&mut MmuCounters)) {
    COUNTERS.with(|c| {
        let mut counters = c.get();
        update(&mut counters);
        c.set(counters);
    });
}

pub fn mmu_counters() -> MmuCounters {
    COUNTERS.with(Cell::get)
}

pub fn active_root() -> Option<PhysicalAddress> {
    ACTIVE_ROOT.with(Cell::get)
}

/// Makes `root` the loaded directory.
///
/// # Safety
///
/// Always safe in emulation; the signature matches the hardware version.
pub unsafe fn load_root(root: PhysicalAddress) {
    ACTIVE_ROOT.with(|r| r.set(Some(root)));
    record(|c| c.loads += 1);
}

pub fn invalidate(_addr: VirtualAddress) {
    record(|c| c.invalidations += 1);
}

pub fn flush_all() {
    record(|c| c.flushes += 1);
}

//! x86_64 hardware paging.

mod entry;
mod flags;
mod table;

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

use crate::{PhysicalAddress, VirtualAddress};

/// Conservative default; modern CPUs report up to 52 bits.
pub const MAX_PHYSICAL_BITS: usize = 48;

pub const MAX_VIRTUAL_BITS: usize = 48;

pub const PAGE_SIZE: usize = 4096;

/// PML4 (3), PDPT (2), PD (1), PT (0).
pub const PAGE_TABLE_LEVELS: usize = 4;

pub const ENTRY_COUNT: usize = 512;

/// First address of the kernel half.
pub const USER_SPACE_END: usize = 1 << (MAX_VIRTUAL_BITS - 1);

#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(
        level < PAGE_TABLE_LEVELS,
        "level out of range for x86_64 page table levels"
    );
    (address >> (12 + level * 9)) & (ENTRY_COUNT - 1)
}

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Virtual addresses must be sign-extended from bit 47.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let upper = addr >> (MAX_VIRTUAL_BITS - 1);
    upper == 0 || upper == usize::MAX >> (MAX_VIRTUAL_BITS - 1)
}

pub fn active_root() -> Option<PhysicalAddress> {
    let (frame, _) = Cr3::read();
    Some(PhysicalAddress::new(frame.start_address().as_u64() as usize))
}

/// Loads `root` into CR3.
///
/// # Safety
///
/// The directory must map the running kernel, its stack and the direct map.
pub unsafe fn load_root(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_u64()));
    // SAFETY: guaranteed by the caller.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

pub fn invalidate(addr: VirtualAddress) {
    tlb::flush(VirtAddr::new(addr.as_u64()));
}

pub fn flush_all() {
    tlb::flush_all();
}

//! Page table structure for software emulation.

use super::ENTRY_COUNT;
use super::entry::PageEntry;

/// One page-sized table of entries, living in an emulated physical frame.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::default());
    }
}

//! Page table structure for x86_64.

use super::ENTRY_COUNT;
use super::entry::PageEntry;

/// One level of the hardware page table hierarchy, living in a physical frame.
#[repr(transparent)]
pub struct PageTable(x86_64::structures::paging::PageTable);

impl PageTable {
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        let entry = &self.0[index];
        PageEntry::from(entry.addr().as_u64() as usize | entry.flags().bits() as usize)
    }

    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: both entry types are transparent wrappers around a 64-bit word.
        unsafe { &mut *(&mut self.0[index] as *mut _ as *mut PageEntry) }
    }

    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    pub fn zero(&mut self) {
        self.0.zero();
    }
}

//! Page table entry for x86_64.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single hardware page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    /// Bits 12-51.
    const ADDRESS_MASK: usize = 0x000F_FFFF_FFFF_F000;

    const FLAGS_MASK: usize = !Self::ADDRESS_MASK;

    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );
        Self((address.as_usize() & Self::ADDRESS_MASK) | (flags.to_raw() & Self::FLAGS_MASK))
    }

    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & Self::FLAGS_MASK)
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.to_raw() & Self::FLAGS_MASK);
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Returns true for a present PD or PDPT entry mapping a 2 MiB or 1 GiB page.
    pub fn is_huge(self) -> bool {
        self.is_present() && self.flags().is_huge()
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl From<usize> for PageEntry {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

//! Page table entry for software emulation.

use crate::PhysicalAddress;

use super::MAX_PHYSICAL_BITS;
use super::flags::PageFlags;

/// A single page table entry.
///
/// Same layout as on x86_64: flags in bits 0-11 and 63, the frame address in
/// bits 12 up to the emulated physical width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const ADDRESS_MASK: usize = ((1 << MAX_PHYSICAL_BITS) - 1) & !0xFFF;

    const FLAGS_MASK: usize = 0xFFF | (1 << 63);

    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );
        Self((address.as_usize() & Self::ADDRESS_MASK) | (flags.to_raw() & Self::FLAGS_MASK))
    }

    /// Returns the frame this entry points at, or `None` if it is not present.
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

    /// Returns true for a present entry above level 0 that maps a large page.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_and_flags_are_independent() {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_writable(true);
        let mut entry = PageEntry::new(PhysicalAddress::new(0x7000), flags);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x7000)));

        flags.set_writable(false);
        flags.set_copy_on_write(true);
        entry.set_flags(flags);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x7000)));
        assert!(entry.flags().is_copy_on_write());
        assert!(!entry.flags().is_writable());
    }

    #[test]
    fn not_present_has_no_address() {
        let entry = PageEntry::new(PhysicalAddress::new(0x7000), PageFlags::empty());
        assert_eq!(entry.address(), None);
        assert!(!entry.is_huge());
    }
}

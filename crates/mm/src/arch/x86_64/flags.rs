//! Page table entry flags for x86_64.

use x86_64::structures::paging::PageTableFlags;

use crate::Sharing;

/// Hardware entry flags. Copy-on-write and shared mappings are tagged with the
/// software-available bits 9 and 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    const COPY_ON_WRITE: PageTableFlags = PageTableFlags::BIT_9;
    const SHARED: PageTableFlags = PageTableFlags::BIT_10;

    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(PageTableFlags::from_bits_truncate(raw as u64))
    }

    pub const fn to_raw(self) -> usize {
        self.0.bits() as usize
    }

    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    pub fn set_present(&mut self, present: bool) {
        self.0.set(PageTableFlags::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    pub fn is_huge(self) -> bool {
        self.0.contains(PageTableFlags::HUGE_PAGE)
    }

    pub fn set_huge(&mut self, huge: bool) {
        self.0.set(PageTableFlags::HUGE_PAGE, huge);
    }

    pub fn is_no_execute(self) -> bool {
        self.0.contains(PageTableFlags::NO_EXECUTE)
    }

    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.0.set(PageTableFlags::NO_EXECUTE, no_execute);
    }

    pub fn is_copy_on_write(self) -> bool {
        self.0.contains(Self::COPY_ON_WRITE)
    }

    pub fn set_copy_on_write(&mut self, cow: bool) {
        self.0.set(Self::COPY_ON_WRITE, cow);
    }

    pub fn sharing(self) -> Sharing {
        if self.0.contains(Self::COPY_ON_WRITE) {
            Sharing::CopyOnWrite
        } else if self.0.contains(Self::SHARED) {
            Sharing::Shared
        } else {
            Sharing::Private
        }
    }

    pub fn set_sharing(&mut self, sharing: Sharing) {
        self.0.set(Self::COPY_ON_WRITE, sharing == Sharing::CopyOnWrite);
        self.0.set(Self::SHARED, sharing == Sharing::Shared);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

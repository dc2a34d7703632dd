//! Page table entry flags for software emulation.

use crate::Sharing;

/// Page table entry flags, using the x86_64 bit assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(usize);

impl PageFlags {
    const PRESENT: usize = 1 << 0;
    const WRITABLE: usize = 1 << 1;
    const USER: usize = 1 << 2;
    const HUGE: usize = 1 << 7;
    /// Software-available bit 9.
    const COPY_ON_WRITE: usize = 1 << 9;
    /// Software-available bit 10.
    const SHARED: usize = 1 << 10;
    const NO_EXECUTE: usize = 1 << 63;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> usize {
        self.0
    }

    fn set(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn set_present(&mut self, present: bool) {
        self.set(Self::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITABLE, writable);
    }

    pub fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    pub fn set_user(&mut self, user: bool) {
        self.set(Self::USER, user);
    }

    pub fn is_huge(self) -> bool {
        self.0 & Self::HUGE != 0
    }

    pub fn set_huge(&mut self, huge: bool) {
        self.set(Self::HUGE, huge);
    }

    pub fn is_no_execute(self) -> bool {
        self.0 & Self::NO_EXECUTE != 0
    }

    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.set(Self::NO_EXECUTE, no_execute);
    }

    pub fn is_copy_on_write(self) -> bool {
        self.0 & Self::COPY_ON_WRITE != 0
    }

    pub fn set_copy_on_write(&mut self, cow: bool) {
        self.set(Self::COPY_ON_WRITE, cow);
    }

    pub fn sharing(self) -> Sharing {
        if self.0 & Self::COPY_ON_WRITE != 0 {
            Sharing::CopyOnWrite
        } else if self.0 & Self::SHARED != 0 {
            Sharing::Shared
        } else {
            Sharing::Private
        }
    }

    pub fn set_sharing(&mut self, sharing: Sharing) {
        self.set(Self::COPY_ON_WRITE, sharing == Sharing::CopyOnWrite);
        self.set(Self::SHARED, sharing == Sharing::Shared);
    }
}

//! Physical and virtual address types.
//!
//! Page tables, kernel stacks and user frames are all reached through physical
//! addresses. The kernel touches them through the direct map, and tests touch them
//! through an emulated physical memory installed per thread.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Converts between physical addresses and pointers the kernel can dereference.
pub enum AddressTranslator {
    /// All physical memory is mapped at a fixed offset in the kernel half.
    Hardware { direct_map_offset: usize },
    /// Physical memory is a host buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates an emulated physical memory of `size` bytes, rounded up to whole frames.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Installs the translator used by every direct-map conversion.
    ///
    /// # Panics
    ///
    /// On hardware, panics if a translator was already installed.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        // Each test thread gets its own physical memory. Replacing it leaks the old
        // buffer so references handed out earlier stay valid.
        #[cfg(any(test, feature = "software-emulation"))]
        {
            let translator: &'static AddressTranslator = alloc::boxed::Box::leak(
                alloc::boxed::Box::new(translator),
            );
            ADDRESS_TRANSLATOR.with(|t| t.set(Some(translator)));
        }
    }

    /// Returns the installed translator.
    ///
    /// # Panics
    ///
    /// Panics if no translator has been installed.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current().expect(
            "address translator not set; call AddressTranslator::set_current during initialization",
        )
    }

    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| t.get())
        }
    }

    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt as *const u8),
        }
    }

    /// Returns the number of bytes of emulated physical memory, if emulated.
    pub fn emulated_size(&self) -> Option<usize> {
        match self {
            Self::Hardware { .. } => None,
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => Some(mem.size()),
        }
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: core::cell::Cell<Option<&'static AddressTranslator>> =
        const { core::cell::Cell::new(None) };
}

macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates an address without validating it.
            ///
            /// # Safety
            ///
            /// The caller must ensure the address is valid for the current architecture.
            #[inline]
            pub const unsafe fn new_unchecked(addr: usize) -> Self {
                Self(addr)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(arch::PAGE_SIZE)
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Rounds up to `align`, saturating at the highest aligned value instead
            /// of wrapping.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                match self.0.checked_add(align - 1) {
                    Some(v) => Self(v & !(align - 1)),
                    None => Self(usize::MAX & !(align - 1)),
                }
            }

            #[inline]
            pub const fn checked_add(self, rhs: usize) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Used as the handle for page tables, page directories and kernel stacks."
);

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Converts a direct-mapped pointer back to the physical address it maps.
    #[inline]
    pub fn from_direct_mapped(virt: VirtualAddress) -> Self {
        let translator = AddressTranslator::current();
        Self::new(translator.virt_to_phys(virt.as_usize()))
    }

    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     User-space addresses, saved stack pointers and the direct-map pointers used to\n\
     reach physical memory are all represented by this type."
);

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns the direct-map pointer for a physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set.
    #[inline]
    pub fn direct_mapped(phys: PhysicalAddress) -> Self {
        let translator = AddressTranslator::current();
        let virt = translator.phys_to_virt(phys.as_usize());

        // Host pointers are not canonical guest addresses.
        #[cfg(any(test, feature = "software-emulation"))]
        if matches!(translator, AddressTranslator::Emulated(_)) {
            return Self(virt);
        }

        Self::new(virt)
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the page table index for this address at `level` (0 is the leaf level).
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Returns true if the address lies in the lower, user-accessible half.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < arch::USER_SPACE_END
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_max_valid_address() {
            let max_addr = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
            let addr = PhysicalAddress::new(max_addr);
            assert_eq!(addr.as_usize(), max_addr);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn align_down_and_up() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3 + 0x24);
            assert_eq!(
                addr.align_down(arch::PAGE_SIZE),
                PhysicalAddress::new(arch::PAGE_SIZE * 3)
            );
            assert_eq!(
                addr.align_up(arch::PAGE_SIZE),
                PhysicalAddress::new(arch::PAGE_SIZE * 4)
            );
            assert!(!addr.is_page_aligned());
        }

        #[test]
        fn frame_number() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 7 + 1);
            assert_eq!(addr.frame_number(), FrameNumber::new(7));
        }

        #[test]
        fn debug_format() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x1000)");
            assert_eq!(format!("{}", addr), "0x1000");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn canonical_halves() {
            let low = VirtualAddress::new(arch::USER_SPACE_END - 1);
            assert!(low.is_user());
            let high = VirtualAddress::new(usize::MAX & !(arch::PAGE_SIZE - 1));
            assert!(!high.is_user());
        }

        #[test]
        #[should_panic(expected = "address is not canonical")]
        fn non_canonical() {
            VirtualAddress::new(arch::USER_SPACE_END);
        }

        #[test]
        fn align_up_saturates() {
            let addr = unsafe { VirtualAddress::new_unchecked(usize::MAX - 3) };
            assert_eq!(
                addr.align_up(arch::PAGE_SIZE).as_usize(),
                usize::MAX & !(arch::PAGE_SIZE - 1)
            );
        }

        #[test]
        fn page_indices() {
            // 0x4000_1234: offset 0x234, leaf index 1, directory index 0, root index 1
            let addr = VirtualAddress::new(0x4000_1234);
            assert_eq!(addr.page_offset(), 0x234);
            assert_eq!(addr.page_index(0), 1);
            assert_eq!(addr.page_index(1), 0);
            assert_eq!(addr.page_index(2), 1);
        }

        #[test]
        fn sub_address() {
            let a = VirtualAddress::new(0x2000_3000);
            let b = VirtualAddress::new(0x2000_1000);
            assert_eq!(a - b, 0x2000);
        }
    }

    mod direct_mapping {
        use super::*;

        #[test]
        fn hardware_round_trip() {
            let translator = AddressTranslator::hardware(0xFFFF_FFC0_0000_0000);
            let virt = translator.phys_to_virt(0x1234);
            assert_eq!(virt, 0xFFFF_FFC0_0000_1234);
            assert_eq!(translator.virt_to_phys(virt), 0x1234);
        }

        #[test]
        fn emulated_round_trip() {
            AddressTranslator::set_current(AddressTranslator::emulated(4 * arch::PAGE_SIZE));
            let phys = PhysicalAddress::new(arch::PAGE_SIZE * 2 + 8);
            let virt = VirtualAddress::direct_mapped(phys);
            assert_eq!(PhysicalAddress::from_direct_mapped(virt), phys);
        }

        #[test]
        fn emulated_translator_can_be_replaced() {
            AddressTranslator::set_current(AddressTranslator::emulated(arch::PAGE_SIZE));
            AddressTranslator::set_current(AddressTranslator::emulated(2 * arch::PAGE_SIZE));
            assert_eq!(
                AddressTranslator::current().emulated_size(),
                Some(2 * arch::PAGE_SIZE)
            );
        }
    }
}

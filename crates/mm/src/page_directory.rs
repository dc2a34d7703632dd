//! Page directories and the table walks beneath them.
//!
//! A [`PageDirectory`] is only a handle: the physical address of a root table. The
//! tables themselves live in physical frames and are reached through the direct
//! map, so a directory can be inspected and changed whether or not it is loaded.

use crate::{
    FrameAllocator, FrameFlag, MapError, PhysicalAddress, VirtualAddress,
    arch::{self, PageEntry, PageFlags, PageTable},
};

/// How a present mapping relates to other address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Only this address space maps the frame, or it is mapped read-only.
    Private,
    /// Deliberately shared memory. Stays writable across a fork.
    Shared,
    /// Shared read-only until the next write, which copies the frame.
    CopyOnWrite,
}

impl PageFlags {
    /// Present, writable and kernel-only.
    pub fn kernel_data() -> Self {
        let mut flags = Self::empty();
        flags.set_present(true);
        flags.set_writable(true);
        flags
    }

    /// Present, user-accessible and optionally writable.
    pub fn user(writable: bool) -> Self {
        let mut flags = Self::empty();
        flags.set_present(true);
        flags.set_user(true);
        flags.set_writable(writable);
        flags
    }
}

/// Which kind of directory a walk modifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    /// The kernel directory. New tables are shared with every user directory.
    Kernel,
    /// A user directory. Shared tables are copied before they are changed.
    User,
}

/// Result of a table walk that may build missing levels.
pub(crate) enum Slot<'a> {
    Entry {
        entry: &'a mut PageEntry,
        table: PhysicalAddress,
    },
    /// The kernel directory maps the range with a large page.
    LargePage,
}

/// # Safety
///
/// `phys` must hold a page table, and the caller must not create overlapping
/// mutable references to it.
pub(crate) unsafe fn table_mut<'a>(phys: PhysicalAddress) -> &'a mut PageTable {
    // SAFETY: guaranteed by the caller.
    unsafe { &mut *VirtualAddress::direct_mapped(phys).as_mut_ptr::<PageTable>() }
}

pub(crate) fn zero_frame(frame: PhysicalAddress) {
    // SAFETY: the frame belongs to the caller and the direct map covers it.
    unsafe {
        core::ptr::write_bytes(
            VirtualAddress::direct_mapped(frame).as_mut_ptr::<u8>(),
            0,
            arch::PAGE_SIZE,
        );
    }
}

pub(crate) fn copy_frame(from: PhysicalAddress, to: PhysicalAddress) {
    // SAFETY: distinct frames, both reachable through the direct map.
    unsafe {
        core::ptr::copy_nonoverlapping(
            VirtualAddress::direct_mapped(from).as_ptr::<u8>(),
            VirtualAddress::direct_mapped(to).as_mut_ptr::<u8>(),
            arch::PAGE_SIZE,
        );
    }
}

/// Allocates a zeroed frame and tags it as a page table.
pub(crate) fn allocate_table(
    frames: &mut dyn FrameAllocator,
    owner: Owner,
) -> Result<PhysicalAddress, MapError> {
    let table = frames.allocate_frame().ok_or(MapError::OutOfFrames)?;
    zero_frame(table);
    frames.set_flag(table, FrameFlag::PageTable);
    if owner == Owner::Kernel {
        frames.set_flag(table, FrameFlag::KernelTable);
    }
    Ok(table)
}

/// Returns true if a user directory may change the table at `table` in place.
pub(crate) fn is_private_table(frames: &dyn FrameAllocator, table: PhysicalAddress) -> bool {
    frames.test_flag(table, FrameFlag::PageTable) && !frames.test_flag(table, FrameFlag::KernelTable)
}

/// A handle on the root table of an address space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageDirectory {
    root: PhysicalAddress,
}

impl core::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageDirectory({:#x})", self.root.as_usize())
    }
}

impl PageDirectory {
    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self { root }
    }

    pub const fn root(self) -> PhysicalAddress {
        self.root
    }

    pub fn is_active(self) -> bool {
        arch::active_root() == Some(self.root)
    }

    /// Loads this directory, flushing all non-global translations.
    ///
    /// # Safety
    ///
    /// The directory must map the running kernel code, its stack and the direct map.
    pub unsafe fn activate(self) {
        // SAFETY: guaranteed by the caller.
        unsafe { arch::load_root(self.root) }
    }

    /// Returns the entry that maps `virt`: a level-0 entry, or a large-page entry
    /// at a higher level. `None` if the walk hits a missing table.
    pub fn entry(self, virt: VirtualAddress) -> Option<PageEntry> {
        let mut table_phys = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: every present non-huge entry above level 0 points at a table.
            let table = unsafe { table_mut(table_phys) };
            let entry = table.entry(virt.page_index(level));
            if entry.is_huge() {
                return Some(entry);
            }
            table_phys = entry.address()?;
        }
        // SAFETY: as above.
        let table = unsafe { table_mut(table_phys) };
        Some(table.entry(virt.page_index(0)))
    }

    /// Translates `virt` to the physical address it maps, if any.
    pub fn translate(self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table_phys = self.root;
        for level in (0..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: every present non-huge entry above level 0 points at a table.
            let table = unsafe { table_mut(table_phys) };
            let entry = table.entry(virt.page_index(level));
            let address = entry.address()?;
            if level == 0 || entry.is_huge() {
                let span = arch::PAGE_SIZE << (9 * level);
                return Some(address + (virt.as_usize() & (span - 1)));
            }
            table_phys = address;
        }
        None
    }

    /// Returns the level-0 entry for `virt` without creating tables.
    ///
    /// `None` unless every table on the way is private to this directory: an
    /// entry in a table shared with the kernel directory is never handed out for
    /// modification.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the directory for the lifetime of
    /// the returned reference.
    pub(crate) unsafe fn leaf_mut<'a>(
        self,
        virt: VirtualAddress,
        frames: &dyn FrameAllocator,
    ) -> Option<&'a mut PageEntry> {
        let mut table_phys = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            if !is_private_table(frames, table_phys) {
                return None;
            }
            // SAFETY: every present non-huge entry above level 0 points at a table.
            let entry = unsafe { table_mut(table_phys) }.entry(virt.page_index(level));
            if entry.is_huge() {
                return None;
            }
            table_phys = entry.address()?;
        }
        if !is_private_table(frames, table_phys) {
            return None;
        }
        // SAFETY: guaranteed by the caller.
        Some(unsafe { table_mut(table_phys) }.entry_mut(virt.page_index(0)))
    }

    /// Walks down to the entry for `virt` at `target` level, creating, copying or
    /// replacing intermediate tables according to `owner`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the directory for the lifetime of
    /// the returned reference.
    pub(crate) unsafe fn walk_or_create<'a>(
        self,
        virt: VirtualAddress,
        target: usize,
        owner: Owner,
        frames: &mut dyn FrameAllocator,
    ) -> Result<Slot<'a>, MapError> {
        let mut table_phys = self.root;
        for level in ((target + 1)..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: every present non-huge entry above level 0 points at a table.
            let table = unsafe { table_mut(table_phys) };
            let entry = table.entry_mut(virt.page_index(level));

            let next = match (entry.address(), owner) {
                (Some(_), Owner::Kernel) if entry.is_huge() => return Ok(Slot::LargePage),
                (Some(existing), Owner::User) if !entry.is_huge() => {
                    if is_private_table(frames, existing) {
                        existing
                    } else {
                        let copy = allocate_table(frames, Owner::User)?;
                        copy_frame(existing, copy);
                        let mut flags = entry.flags();
                        flags.set_user(true);
                        flags.set_writable(true);
                        *entry = PageEntry::new(copy, flags);
                        trace_table("copied shared table", level, copy);
                        copy
                    }
                }
                (Some(existing), Owner::Kernel) => existing,
                (_, owner) => {
                    // Missing, or a large page in a user directory: start a fresh table.
                    let fresh = allocate_table(frames, owner)?;
                    let flags = match owner {
                        Owner::Kernel => PageFlags::kernel_data(),
                        Owner::User => PageFlags::user(true),
                    };
                    *entry = PageEntry::new(fresh, flags);
                    trace_table("new table", level, fresh);
                    fresh
                }
            };
            table_phys = next;
        }

        // SAFETY: guaranteed by the caller.
        let table = unsafe { table_mut(table_phys) };
        Ok(Slot::Entry {
            entry: table.entry_mut(virt.page_index(target)),
            table: table_phys,
        })
    }
}

#[cfg(feature = "detailed-logging")]
fn trace_table(what: &str, level: usize, table: PhysicalAddress) {
    log::trace!("{} at level {}: {}", what, level, table);
}

#[cfg(not(feature = "detailed-logging"))]
fn trace_table(_what: &str, _level: usize, _table: PhysicalAddress) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressTranslator, FrameTable, PAGE_SIZE};

    fn setup() -> FrameTable {
        AddressTranslator::set_current(AddressTranslator::emulated(64 * PAGE_SIZE));
        FrameTable::new(PhysicalAddress::new(0), 64)
    }

    fn empty_directory(frames: &mut FrameTable, owner: Owner) -> PageDirectory {
        PageDirectory::from_root(allocate_table(frames, owner).unwrap())
    }

    fn map(dir: PageDirectory, virt: usize, phys: usize, frames: &mut FrameTable) {
        match unsafe { dir.walk_or_create(VirtualAddress::new(virt), 0, Owner::User, frames) }
            .unwrap()
        {
            Slot::Entry { entry, .. } => {
                *entry = PageEntry::new(PhysicalAddress::new(phys), PageFlags::user(true))
            }
            Slot::LargePage => panic!("unexpected large page"),
        }
    }

    #[test]
    fn translate_after_walk() {
        let mut frames = setup();
        let dir = empty_directory(&mut frames, Owner::User);
        map(dir, 0x2000_0000, 0x5000, &mut frames);

        assert_eq!(
            dir.translate(VirtualAddress::new(0x2000_0123)),
            Some(PhysicalAddress::new(0x5123))
        );
        assert_eq!(dir.translate(VirtualAddress::new(0x2000_1000)), None);
        // Root, one level-1 table and one leaf table.
        assert_eq!(frames.free_frames(), 61);
    }

    #[test]
    fn walk_reuses_tables() {
        let mut frames = setup();
        let dir = empty_directory(&mut frames, Owner::User);
        map(dir, 0x2000_0000, 0x5000, &mut frames);
        map(dir, 0x2000_1000, 0x6000, &mut frames);
        assert_eq!(frames.free_frames(), 61);
    }

    #[test]
    fn missing_tables_have_no_leaf() {
        let mut frames = setup();
        let dir = empty_directory(&mut frames, Owner::User);
        assert!(unsafe { dir.leaf_mut(VirtualAddress::new(0x2000_0000), &frames) }.is_none());
        assert!(dir.entry(VirtualAddress::new(0x2000_0000)).is_none());
    }

    #[test]
    fn new_tables_are_tagged() {
        let mut frames = setup();
        let dir = empty_directory(&mut frames, Owner::Kernel);
        assert!(frames.test_flag(dir.root(), FrameFlag::KernelTable));
        assert!(!is_private_table(&frames, dir.root()));
    }

    #[test]
    fn shared_leaf_tables_are_not_handed_out() {
        let mut frames = setup();
        let dir = empty_directory(&mut frames, Owner::User);
        map(dir, 0x2000_0000, 0x5000, &mut frames);
        let virt = VirtualAddress::new(0x2000_0000);
        assert!(unsafe { dir.leaf_mut(virt, &frames) }.is_some());

        // Tag the leaf table as if the kernel directory shared it.
        let middle = unsafe { table_mut(dir.root()) }.entry(virt.page_index(2));
        let leaf_table = unsafe { table_mut(middle.address().unwrap()) }
            .entry(virt.page_index(1))
            .address()
            .unwrap();
        frames.set_flag(leaf_table, FrameFlag::KernelTable);
        assert!(unsafe { dir.leaf_mut(virt, &frames) }.is_none());
        assert_eq!(dir.translate(virt), Some(PhysicalAddress::new(0x5000)));
    }
}

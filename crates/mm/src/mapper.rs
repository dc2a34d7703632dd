//! The address-space mapper.
//!
//! Owns the kernel directory and performs every page-table change on behalf of
//! processes: building user directories seeded with the kernel mappings, mapping
//! and unmapping pages, sharing ranges copy-on-write, and resolving copy-on-write
//! faults. It knows nothing about tasks.
//!
//! Every change to the directory the CPU has loaded is followed by an invalidation
//! of exactly the address changed. Full flushes happen on directory switches and
//! once after a copy-on-write sharing pass.

use crate::{
    FrameAllocator, FrameFlag, MapError, PAGE_SIZE, PageDirectory, PageNumber, PhysicalAddress,
    Sharing, VirtualAddress,
    arch::{self, PageEntry, PageFlags},
    page_directory::{
        Owner, Slot, allocate_table, copy_frame, is_private_table, table_mut, zero_frame,
    },
};

pub struct AddressSpaceMapper {
    kernel: PageDirectory,
}

impl AddressSpaceMapper {
    /// Builds a kernel directory that identity-maps physical memory from the second
    /// page up to `identity_end`. Page zero stays unmapped.
    pub fn bootstrap(
        frames: &mut dyn FrameAllocator,
        identity_end: PhysicalAddress,
    ) -> Result<Self, MapError> {
        let root = allocate_table(frames, Owner::Kernel)?;
        let mapper = Self {
            kernel: PageDirectory::from_root(root),
        };
        let end = PageNumber::containing_end(VirtualAddress::new(identity_end.as_usize()));
        for page in PageNumber::range(PageNumber::new(1), end) {
            let addr = page.start();
            mapper.map_kernel_page(
                addr,
                PhysicalAddress::new(addr.as_usize()),
                PageFlags::kernel_data(),
                frames,
            )?;
        }
        log::debug!(
            "kernel directory at {} identity-maps {} pages",
            root,
            end.as_usize().saturating_sub(1)
        );
        Ok(mapper)
    }

    /// Takes over an existing kernel directory, such as the one the bootloader left
    /// loaded, and tags every table reachable from it as shared with user
    /// directories.
    pub fn adopt(kernel: PageDirectory, frames: &mut dyn FrameAllocator) -> Self {
        fn mark(table: PhysicalAddress, level: usize, frames: &mut dyn FrameAllocator) {
            frames.set_flag(table, FrameFlag::PageTable);
            frames.set_flag(table, FrameFlag::KernelTable);
            if level == 0 {
                return;
            }
            for index in 0..arch::ENTRY_COUNT {
                // SAFETY: present non-huge entries above level 0 point at tables.
                let entry = unsafe { table_mut(table) }.entry(index);
                if let (Some(next), false) = (entry.address(), entry.is_huge()) {
                    mark(next, level - 1, frames);
                }
            }
        }

        mark(kernel.root(), arch::PAGE_TABLE_LEVELS - 1, frames);
        Self { kernel }
    }

    pub fn kernel_directory(&self) -> PageDirectory {
        self.kernel
    }

    /// Allocates a directory whose root is a copy of the kernel root, so every
    /// kernel mapping is valid in the new address space.
    pub fn create_user_directory(
        &self,
        frames: &mut dyn FrameAllocator,
    ) -> Result<PageDirectory, MapError> {
        let root = allocate_table(frames, Owner::User)?;
        copy_frame(self.kernel.root(), root);
        Ok(PageDirectory::from_root(root))
    }

    /// Installs or replaces the translation for `virt` in a user directory.
    ///
    /// Missing tables are allocated and zeroed; a slot holding a large page is
    /// replaced by a fresh table; tables shared with the kernel directory are
    /// copied first. Returns the physical address of the level-0 table now holding
    /// the entry.
    pub fn map_page(
        &self,
        directory: PageDirectory,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<PhysicalAddress, MapError> {
        if !virt.is_page_aligned() || !phys.is_page_aligned() {
            return Err(MapError::Misaligned);
        }
        // SAFETY: mapper operations run with exclusive access to the tables.
        let slot = unsafe { directory.walk_or_create(virt, 0, Owner::User, frames)? };
        let Slot::Entry { entry, table } = slot else {
            unreachable!("user walks replace large pages");
        };
        let mut flags = flags;
        flags.set_present(true);
        *entry = PageEntry::new(phys, flags);
        self.invalidate(directory, virt);
        trace_mapping("map", directory, virt, Some(phys));
        Ok(table)
    }

    /// Installs a 4 KiB translation in the kernel directory.
    ///
    /// Returns `Ok(false)` and leaves the tables untouched if `virt` already lies
    /// inside a large page.
    pub fn map_kernel_page(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<bool, MapError> {
        self.install_kernel(virt, phys, flags, 0, frames)
    }

    /// Maps a 2 MiB page in the kernel directory.
    pub fn map_kernel_large_page(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<bool, MapError> {
        let mut flags = flags;
        flags.set_huge(true);
        self.install_kernel(virt, phys, flags, 1, frames)
    }

    fn install_kernel(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        level: usize,
        frames: &mut dyn FrameAllocator,
    ) -> Result<bool, MapError> {
        let span = PAGE_SIZE << (9 * level);
        if !virt.is_aligned(span) || !phys.is_aligned(span) {
            return Err(MapError::Misaligned);
        }
        // SAFETY: mapper operations run with exclusive access to the tables.
        match unsafe { self.kernel.walk_or_create(virt, level, Owner::Kernel, frames)? } {
            Slot::Entry { entry, .. } => {
                let mut flags = flags;
                flags.set_present(true);
                *entry = PageEntry::new(phys, flags);
                self.invalidate(self.kernel, virt);
                Ok(true)
            }
            Slot::LargePage => {
                log::warn!("refusing to map {} inside a kernel large page", virt);
                Ok(false)
            }
        }
    }

    /// Clears the translation for `virt`, returning the frame it mapped. Page
    /// tables and reference counts are left alone. Translations in tables shared
    /// with the kernel directory are never cleared.
    pub fn unmap_page(
        &self,
        directory: PageDirectory,
        virt: VirtualAddress,
        frames: &dyn FrameAllocator,
    ) -> Option<PhysicalAddress> {
        // SAFETY: mapper operations run with exclusive access to the tables.
        let entry = unsafe { directory.leaf_mut(virt.align_down(PAGE_SIZE), frames) }?;
        let phys = entry.address()?;
        entry.clear();
        self.invalidate(directory, virt);
        trace_mapping("unmap", directory, virt, Some(phys));
        Some(phys)
    }

    /// Frees a user directory and every table it owns privately. Tables shared with
    /// the kernel directory and the frames the directory mapped are not touched;
    /// callers drop those references first.
    pub fn destroy_user_directory(
        &self,
        directory: PageDirectory,
        frames: &mut dyn FrameAllocator,
    ) {
        fn free(table: PhysicalAddress, level: usize, frames: &mut dyn FrameAllocator) {
            if level > 0 {
                for index in 0..arch::ENTRY_COUNT {
                    // SAFETY: present non-huge entries above level 0 point at tables.
                    let entry = unsafe { table_mut(table) }.entry(index);
                    if let Some(next) = entry.address()
                        && !entry.is_huge()
                        && is_private_table(frames, next)
                    {
                        free(next, level - 1, frames);
                    }
                }
            }
            frames.free_frame(table);
        }

        if directory == self.kernel {
            log::warn!("refusing to destroy the kernel directory");
            return;
        }
        if directory.is_active() {
            log::warn!("destroying the loaded directory {:?}", directory);
        }
        free(directory.root(), arch::PAGE_TABLE_LEVELS - 1, frames);
    }

    /// Invalidates the cached translation for `virt` if `directory` is loaded.
    pub fn invalidate(&self, directory: PageDirectory, virt: VirtualAddress) {
        if directory.is_active() {
            arch::invalidate(virt);
        }
    }

    /// Flushes every cached translation if `directory` is loaded.
    pub fn flush(&self, directory: PageDirectory) {
        if directory.is_active() {
            arch::flush_all();
        }
    }

    /// Maps every present page of `[start, end)` in `parent` into `child` at the
    /// same address, sharing the frame and adding a reference to it.
    ///
    /// Private writable pages become read-only and copy-on-write in both
    /// directories. Shared pages stay writable. The parent is not invalidated here;
    /// callers flush it once after sharing all ranges. Returns the number of pages
    /// shared.
    pub fn share_copy_on_write(
        &self,
        parent: PageDirectory,
        child: PageDirectory,
        start: VirtualAddress,
        end: VirtualAddress,
        frames: &mut dyn FrameAllocator,
    ) -> Result<usize, MapError> {
        let mut shared = 0;
        for page in PageNumber::range(PageNumber::from(start), PageNumber::containing_end(end)) {
            let virt = page.start();
            // SAFETY: mapper operations run with exclusive access to the tables.
            let Some(entry) = (unsafe { parent.leaf_mut(virt, &*frames) }) else {
                continue;
            };
            let Some(phys) = entry.address() else {
                continue;
            };

            let mut flags = entry.flags();
            if flags.sharing() == Sharing::Private && flags.is_writable() {
                flags.set_writable(false);
                flags.set_sharing(Sharing::CopyOnWrite);
                entry.set_flags(flags);
            }

            // SAFETY: as above; the child walk never touches the parent's tables
            // because shared kernel tables are copied before they change.
            let slot = unsafe { child.walk_or_create(virt, 0, Owner::User, frames)? };
            let Slot::Entry { entry, .. } = slot else {
                unreachable!("user walks replace large pages");
            };
            *entry = PageEntry::new(phys, flags);
            frames.reference(phys);
            shared += 1;
        }
        Ok(shared)
    }

    /// Gives `directory` a private, writable copy of the copy-on-write page at
    /// `virt`, returning the frame now mapped.
    ///
    /// If nothing else references the frame it is simply made writable again.
    pub fn resolve_copy_on_write(
        &self,
        directory: PageDirectory,
        virt: VirtualAddress,
        frames: &mut dyn FrameAllocator,
    ) -> Result<PhysicalAddress, MapError> {
        let virt = virt.align_down(PAGE_SIZE);
        // SAFETY: mapper operations run with exclusive access to the tables.
        let entry = unsafe { directory.leaf_mut(virt, &*frames) }.ok_or(MapError::NotMapped)?;
        let phys = entry.address().ok_or(MapError::NotMapped)?;
        let mut flags = entry.flags();
        if flags.sharing() != Sharing::CopyOnWrite {
            return if flags.is_writable() {
                Ok(phys)
            } else {
                Err(MapError::NotWritable)
            };
        }

        flags.set_writable(true);
        flags.set_sharing(Sharing::Private);
        let target = if frames.references(phys) <= 1 {
            entry.set_flags(flags);
            phys
        } else {
            let copy = frames.allocate_frame().ok_or(MapError::OutOfFrames)?;
            copy_frame(phys, copy);
            *entry = PageEntry::new(copy, flags);
            frames.release_and_free(phys);
            copy
        };
        self.invalidate(directory, virt);
        trace_mapping("resolve cow", directory, virt, Some(target));
        Ok(target)
    }

    /// Unmaps every page of `[start, end)` and drops a reference to each frame,
    /// freeing frames nothing else maps. Returns the number of pages unmapped.
    pub fn release_range(
        &self,
        directory: PageDirectory,
        start: VirtualAddress,
        end: VirtualAddress,
        frames: &mut dyn FrameAllocator,
    ) -> usize {
        let mut released = 0;
        for page in PageNumber::range(PageNumber::from(start), PageNumber::containing_end(end)) {
            if let Some(phys) = self.unmap_page(directory, page.start(), &*frames) {
                frames.release_and_free(phys);
                released += 1;
            }
        }
        released
    }

    /// Copies bytes out of user memory mapped by `directory`.
    pub fn read_user(
        &self,
        directory: PageDirectory,
        virt: VirtualAddress,
        buffer: &mut [u8],
    ) -> Result<(), MapError> {
        let mut done = 0;
        while done < buffer.len() {
            let addr = virt.checked_add(done).ok_or(MapError::NotMapped)?;
            let chunk = (PAGE_SIZE - addr.page_offset()).min(buffer.len() - done);
            let phys = user_frame(directory, addr)?;
            // SAFETY: the chunk stays within one mapped frame.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    VirtualAddress::direct_mapped(phys).as_ptr::<u8>().add(addr.page_offset()),
                    buffer[done..].as_mut_ptr(),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies bytes into user memory mapped by `directory`, resolving copy-on-write
    /// pages first, as a user write would.
    pub fn write_user(
        &self,
        directory: PageDirectory,
        virt: VirtualAddress,
        data: &[u8],
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), MapError> {
        let mut done = 0;
        while done < data.len() {
            let addr = virt.checked_add(done).ok_or(MapError::NotMapped)?;
            let chunk = (PAGE_SIZE - addr.page_offset()).min(data.len() - done);
            let entry = user_entry(directory, addr)?;
            let phys = if entry.flags().is_writable() {
                entry.address().ok_or(MapError::NotMapped)?
            } else {
                self.resolve_copy_on_write(directory, addr, frames)?
            };
            // SAFETY: the chunk stays within one mapped frame.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[done..].as_ptr(),
                    VirtualAddress::direct_mapped(phys)
                        .as_mut_ptr::<u8>()
                        .add(addr.page_offset()),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    /// Allocates a zeroed frame and maps it at `virt`.
    pub fn map_zeroed(
        &self,
        directory: PageDirectory,
        virt: VirtualAddress,
        flags: PageFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<PhysicalAddress, MapError> {
        let frame = frames.allocate_frame().ok_or(MapError::OutOfFrames)?;
        zero_frame(frame);
        if let Err(e) = self.map_page(directory, virt, frame, flags, frames) {
            frames.free_frame(frame);
            return Err(e);
        }
        Ok(frame)
    }
}

fn user_entry(directory: PageDirectory, virt: VirtualAddress) -> Result<PageEntry, MapError> {
    directory
        .entry(virt)
        .filter(|e| e.is_present() && e.flags().is_user())
        .ok_or(MapError::NotMapped)
}

fn user_frame(directory: PageDirectory, virt: VirtualAddress) -> Result<PhysicalAddress, MapError> {
    user_entry(directory, virt)?;
    directory
        .translate(virt.align_down(PAGE_SIZE))
        .ok_or(MapError::NotMapped)
}

#[cfg(feature = "detailed-logging")]
fn trace_mapping(
    what: &str,
    directory: PageDirectory,
    virt: VirtualAddress,
    phys: Option<PhysicalAddress>,
) {
    log::trace!("{} {:?} {} -> {:?}", what, directory, virt, phys);
}

#[cfg(not(feature = "detailed-logging"))]
fn trace_mapping(
    _what: &str,
    _directory: PageDirectory,
    _virt: VirtualAddress,
    _phys: Option<PhysicalAddress>,
) {
}

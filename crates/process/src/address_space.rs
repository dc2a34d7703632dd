//! The address space a task runs in.

use alloc::sync::Arc;

use mm::{AddressSpaceMapper, FrameAllocator, PageDirectory, VmaTable};
use spin::{Mutex, MutexGuard};

/// Kernel tasks all run in the kernel directory. A user space is shared by
/// threads through the `Arc` and torn down when its last task releases it.
#[derive(Clone)]
pub enum AddressSpace {
    Kernel,
    User(Arc<UserSpace>),
}

impl AddressSpace {
    /// The directory to load while a task in this space runs.
    pub fn directory(&self, mapper: &AddressSpaceMapper) -> PageDirectory {
        match self {
            Self::Kernel => mapper.kernel_directory(),
            Self::User(space) => space.directory(),
        }
    }

    pub fn user(&self) -> Option<&Arc<UserSpace>> {
        match self {
            Self::Kernel => None,
            Self::User(space) => Some(space),
        }
    }
}

pub struct UserSpace {
    directory: PageDirectory,
    vmas: Mutex<VmaTable>,
}

impl UserSpace {
    pub fn new(directory: PageDirectory, vmas: VmaTable) -> Self {
        Self {
            directory,
            vmas: Mutex::new(vmas),
        }
    }

    pub fn directory(&self) -> PageDirectory {
        self.directory
    }

    pub fn vmas(&self) -> MutexGuard<'_, VmaTable> {
        self.vmas.lock()
    }

    /// Unmaps every area, dropping one reference per mapped frame, then frees
    /// the directory and its private tables. Returns the pages unmapped.
    pub fn tear_down(self, mapper: &AddressSpaceMapper, frames: &mut dyn FrameAllocator) -> usize {
        let vmas = self.vmas.into_inner();
        let pages = vmas
            .iter()
            .map(|vma| mapper.release_range(self.directory, vma.start, vma.end, frames))
            .sum();
        mapper.destroy_user_directory(self.directory, frames);
        pages
    }
}

/// Drops one task's hold on `space`, tearing the space down if it was the last.
pub(crate) fn release(
    space: AddressSpace,
    mapper: &AddressSpaceMapper,
    frames: &mut dyn FrameAllocator,
) {
    let AddressSpace::User(space) = space else {
        return;
    };
    if let Ok(space) = Arc::try_unwrap(space) {
        let directory = space.directory();
        let pages = space.tear_down(mapper, frames);
        log::debug!("released address space {:?} ({} pages)", directory, pages);
    }
}

//! Fixed layout of a user address space.

/// The user stack occupies `[USER_STACK_BASE, USER_STACK_BASE + USER_STACK_PAGES * PAGE_SIZE)`.
pub const USER_STACK_BASE: usize = 0x4000_0000;

pub const USER_STACK_PAGES: usize = 1;

/// Where the search for anonymous mappings starts, above typical program images.
pub const MMAP_BASE: usize = 0x2000_0000;

/// Anonymous mappings stay below the user stack.
pub const MMAP_LIMIT: usize = USER_STACK_BASE;

/// Capacity of a VMA table.
pub const VMA_MAX: usize = 64;

/// Candidate positions `VmaTable::find_free` tries before giving up.
pub const FIND_FREE_PROBES: usize = 1024;

#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Memory Core
//!
//! The memory half of the Polaris process core:
//!
//! - Physical and virtual address types, and the direct map between them.
//! - A frame allocator with saturating per-frame reference counts.
//! - The address-space mapper: kernel and user page directories, copy-on-write
//!   sharing and its resolution.
//! - Per-process VMA tables.
//!
//! Tests, and builds with the `software-emulation` feature, run against an
//! emulated physical memory and a host-side model of x86_64 paging.

extern crate alloc;

mod address;
mod arch;
mod error;
mod frame;
mod frame_table;
pub mod layout;
mod mapper;
mod numbers;
mod page_directory;
mod vma;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use error::{MapError, VmaError};
pub use frame::{Frame, FrameFlag, FrameFlags, MAX_REFERENCES};
pub use frame_table::{FrameAllocator, FrameTable};
pub use mapper::AddressSpaceMapper;
pub use numbers::{FrameNumber, PageNumber};
pub use page_directory::{PageDirectory, Sharing};
pub use vma::{Vma, VmaFlags, VmaKind, VmaTable};

pub use arch::{PAGE_SIZE, PageEntry, PageFlags};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, MmuCounters, mmu_counters};

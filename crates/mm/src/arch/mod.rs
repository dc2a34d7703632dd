//! Page-table format and translation-cache control for the target architecture.
//!
//! Tests and the `software-emulation` feature use a host-side model of x86_64 paging;
//! everything else uses the hardware.

// NOTE: The x86_64 module is compiled during tests too so rust-analyzer sees it.
#[cfg(all(target_arch = "x86_64"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

pub use self::{PageEntry, PageFlags, PageTable};

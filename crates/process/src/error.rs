use core::fmt;

use mm::{MapError, VmaError};

/// Failures of process-core operations.
///
/// None of them is fatal to the kernel: the requested operation simply did not
/// happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// Every preemptive slot of the task table is in use.
    NoFreeSlot,
    /// No physical frame for a stack, page table or page copy.
    OutOfFrames,
    /// The task's VMA table is full.
    NoFreeVmaSlot,
    /// No gap in the address space is large enough.
    NoAddressSpace,
    /// The address or range is unmapped, misaligned or overlaps an existing area.
    BadAddress,
    /// The slot is unused or no task has the process id.
    NoSuchTask,
    /// The signal number is out of range.
    InvalidSignal,
    /// The target refuses the operation.
    NotPermitted,
    /// The caller has no child matching the request.
    NoChildren,
    /// Nothing is ready yet; retry once woken.
    WouldBlock,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFreeSlot => write!(f, "no free task slot"),
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::NoFreeVmaSlot => write!(f, "no free VMA slot"),
            Self::NoAddressSpace => write!(f, "no free address range"),
            Self::BadAddress => write!(f, "bad address"),
            Self::NoSuchTask => write!(f, "no such task"),
            Self::InvalidSignal => write!(f, "invalid signal number"),
            Self::NotPermitted => write!(f, "operation not permitted"),
            Self::NoChildren => write!(f, "no matching child"),
            Self::WouldBlock => write!(f, "operation would block"),
        }
    }
}

impl From<MapError> for TaskError {
    fn from(error: MapError) -> Self {
        match error {
            MapError::OutOfFrames => Self::OutOfFrames,
            MapError::NotMapped | MapError::NotWritable | MapError::Misaligned => {
                Self::BadAddress
            }
        }
    }
}

impl From<VmaError> for TaskError {
    fn from(error: VmaError) -> Self {
        match error {
            VmaError::TableFull => Self::NoFreeVmaSlot,
            VmaError::InvalidRange | VmaError::Overlaps => Self::BadAddress,
        }
    }
}

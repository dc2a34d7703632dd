use core::fmt;

/// Failures of page-table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame was available for a page table, directory or page copy.
    OutOfFrames,
    /// The address has no present user mapping.
    NotMapped,
    /// A write hit a read-only page that is not copy-on-write.
    NotWritable,
    /// The address or range is not page-aligned.
    Misaligned,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::NotMapped => write!(f, "address is not mapped"),
            Self::NotWritable => write!(f, "page is read-only"),
            Self::Misaligned => write!(f, "address is not page-aligned"),
        }
    }
}

/// Failures of VMA table updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaError {
    /// The range is empty or inverted after page alignment.
    InvalidRange,
    /// Every slot of the table is in use.
    TableFull,
    /// The range overlaps an existing area.
    Overlaps,
}

impl fmt::Display for VmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange => write!(f, "empty or inverted address range"),
            Self::TableFull => write!(f, "no free VMA slot"),
            Self::Overlaps => write!(f, "range overlaps an existing area"),
        }
    }
}

use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Reference count at which a frame becomes permanent.
pub const MAX_REFERENCES: u8 = u8::MAX;

/// Metadata for one physical frame.
///
/// The reference count tracks how many address spaces map the frame. It saturates at
/// [`MAX_REFERENCES`]; a saturated frame is never decremented again and so is never
/// freed, which trades a leak for never freeing a frame that is still mapped.
pub struct Frame {
    pub flags: FrameFlags,
    references: AtomicU8,
}

impl Frame {
    pub fn references(&self) -> u8 {
        self.references.load(Ordering::Acquire)
    }

    pub fn set_references(&self, count: u8) {
        self.references.store(count, Ordering::Release);
    }

    /// Adds a reference, returning the new count.
    pub fn reference(&self) -> u8 {
        match self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_REFERENCES).then(|| n + 1)
            }) {
            Ok(previous) => previous + 1,
            Err(saturated) => saturated,
        }
    }

    /// Drops a reference, returning the new count. Zero means nothing maps the
    /// frame any more.
    pub fn release(&self) -> u8 {
        match self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != 0 && n != MAX_REFERENCES).then(|| n - 1)
            }) {
            Ok(previous) => previous - 1,
            Err(current) => current,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.references() == MAX_REFERENCES
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            flags: FrameFlags::new(),
            references: AtomicU8::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    Allocated = 1 << 0,
    /// Never handed out by the allocator.
    Reserved = 1 << 1,
    /// Holds a page table or page directory.
    PageTable = 1 << 2,
    /// A page table reachable from the kernel directory. User directories share it
    /// and must copy it before changing it.
    KernelTable = 1 << 3,
}

/// Atomic flags for a physical frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Sets the given flag through a mutable reference.
    pub fn set(&mut self, flag: FrameFlag) {
        *self.0.get_mut() |= flag as u64;
    }

    pub fn clear(&mut self, flag: FrameFlag) {
        *self.0.get_mut() &= !(flag as u64);
    }

    pub fn test(&mut self, flag: FrameFlag) -> bool {
        *self.0.get_mut() & flag as u64 != 0
    }

    pub fn clear_all(&mut self) {
        *self.0.get_mut() = 0;
    }

    pub fn atomic_set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u64, Ordering::AcqRel);
    }

    pub fn atomic_clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u64), Ordering::AcqRel);
    }

    pub fn atomic_test(&self, flag: FrameFlag) -> bool {
        self.0.load(Ordering::Acquire) & flag as u64 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_counts_saturate() {
        let frame = Frame::default();
        frame.set_references(MAX_REFERENCES - 1);
        assert_eq!(frame.reference(), MAX_REFERENCES);
        assert_eq!(frame.reference(), MAX_REFERENCES);
        assert!(frame.is_pinned());
        assert_eq!(frame.release(), MAX_REFERENCES);
    }

    #[test]
    fn release_stops_at_zero() {
        let frame = Frame::default();
        frame.set_references(2);
        assert_eq!(frame.release(), 1);
        assert_eq!(frame.release(), 0);
        assert_eq!(frame.release(), 0);
    }

    #[test]
    fn atomic_flags() {
        let flags = FrameFlags::new();
        flags.atomic_set(FrameFlag::PageTable);
        flags.atomic_set(FrameFlag::KernelTable);
        flags.atomic_clear(FrameFlag::KernelTable);
        assert!(flags.atomic_test(FrameFlag::PageTable));
        assert!(!flags.atomic_test(FrameFlag::KernelTable));
    }
}

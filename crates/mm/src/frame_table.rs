//! Physical frame allocation and per-frame reference counts.
//!
//! [`FrameAllocator`] is the contract the rest of the memory core relies on:
//! single-frame and contiguous allocation, freeing, and the saturating reference
//! count that decides when a frame shared between address spaces may be freed.
//! [`FrameTable`] implements it with a first-fit scan over one contiguous
//! physical range.

use alloc::vec::Vec;

use crate::{Frame, FrameFlag, FrameNumber, PhysicalAddress};

pub trait FrameAllocator {
    /// Allocates one frame with a reference count of one.
    fn allocate_frame(&mut self) -> Option<PhysicalAddress>;

    /// Allocates `count` physically contiguous frames, each with a reference count
    /// of one, returning the first.
    fn allocate_contiguous(&mut self, count: usize) -> Option<PhysicalAddress>;

    /// Returns a frame to the free pool. Freeing a frame that is not allocated is
    /// ignored.
    fn free_frame(&mut self, frame: PhysicalAddress);

    /// Returns the metadata for a frame this allocator manages.
    fn frame(&self, frame: PhysicalAddress) -> Option<&Frame>;

    fn free_frames(&self) -> usize;

    /// Adds a reference to `frame`, returning the new count.
    fn reference(&self, frame: PhysicalAddress) -> u8 {
        self.frame(frame).map_or(0, Frame::reference)
    }

    /// Drops a reference to `frame`, returning the new count.
    fn release(&self, frame: PhysicalAddress) -> u8 {
        self.frame(frame).map_or(0, Frame::release)
    }

    fn references(&self, frame: PhysicalAddress) -> u8 {
        self.frame(frame).map_or(0, Frame::references)
    }

    /// Drops a reference and frees the frame once nothing maps it. Returns true if
    /// the frame was freed.
    fn release_and_free(&mut self, frame: PhysicalAddress) -> bool {
        let managed = self.frame(frame).is_some();
        if managed && self.release(frame) == 0 {
            self.free_frame(frame);
            true
        } else {
            false
        }
    }

    fn test_flag(&self, frame: PhysicalAddress, flag: FrameFlag) -> bool {
        self.frame(frame).is_some_and(|f| f.flags.atomic_test(flag))
    }

    fn set_flag(&self, frame: PhysicalAddress, flag: FrameFlag) {
        if let Some(f) = self.frame(frame) {
            f.flags.atomic_set(flag);
        }
    }
}

/// First-fit frame allocator over `[base, base + count)` frames.
pub struct FrameTable {
    base: FrameNumber,
    frames: Vec<Frame>,
    free: usize,
    /// Index to resume single-frame searches from.
    hint: usize,
}

impl FrameTable {
    pub fn new(base: PhysicalAddress, count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        frames.resize_with(count, Frame::default);
        Self {
            base: base.align_up(crate::PAGE_SIZE).frame_number(),
            frames,
            free: count,
            hint: 0,
        }
    }

    /// Marks a frame as never allocatable.
    pub fn reserve(&mut self, frame: PhysicalAddress) {
        if let Some(index) = self.index(frame) {
            let entry = &mut self.frames[index];
            if !entry.flags.test(FrameFlag::Reserved) && !entry.flags.test(FrameFlag::Allocated)
            {
                self.free -= 1;
            }
            entry.flags.set(FrameFlag::Reserved);
        }
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    fn index(&self, frame: PhysicalAddress) -> Option<usize> {
        let number = frame.frame_number();
        (number >= self.base)
            .then(|| number - self.base)
            .filter(|&i| i < self.frames.len())
    }

    fn is_free(&self, index: usize) -> bool {
        let flags = &self.frames[index].flags;
        !flags.atomic_test(FrameFlag::Allocated) && !flags.atomic_test(FrameFlag::Reserved)
    }

    fn claim(&mut self, index: usize) -> PhysicalAddress {
        let frame = &mut self.frames[index];
        frame.flags.set(FrameFlag::Allocated);
        frame.set_references(1);
        self.free -= 1;
        (self.base + index).start()
    }
}

impl FrameAllocator for FrameTable {
    fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        let len = self.frames.len();
        let index = (0..len)
            .map(|i| (self.hint + i) % len)
            .find(|&i| self.is_free(i))?;
        self.hint = (index + 1) % len;
        Some(self.claim(index))
    }

    fn allocate_contiguous(&mut self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 || count > self.free {
            return None;
        }
        let mut run = 0;
        for index in 0..self.frames.len() {
            run = if self.is_free(index) { run + 1 } else { 0 };
            if run == count {
                let first = index + 1 - count;
                for i in first..=index {
                    self.claim(i);
                }
                return Some((self.base + first).start());
            }
        }
        None
    }

    fn free_frame(&mut self, frame: PhysicalAddress) {
        let Some(index) = self.index(frame) else {
            log::warn!("free of unmanaged frame {}", frame);
            return;
        };
        let entry = &mut self.frames[index];
        if !entry.flags.test(FrameFlag::Allocated) {
            return;
        }
        entry.flags.clear_all();
        entry.set_references(0);
        self.free += 1;
    }

    fn frame(&self, frame: PhysicalAddress) -> Option<&Frame> {
        self.index(frame).map(|i| &self.frames[i])
    }

    fn free_frames(&self) -> usize {
        self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    fn table(count: usize) -> FrameTable {
        FrameTable::new(PhysicalAddress::new(0x10_0000), count)
    }

    #[test]
    fn allocates_distinct_frames() {
        let mut frames = table(4);
        let a = frames.allocate_frame().unwrap();
        let b = frames.allocate_frame().unwrap();
        assert_ne!(a, b);
        assert!(a.is_page_aligned());
        assert_eq!(frames.references(a), 1);
        assert_eq!(frames.free_frames(), 2);
    }

    #[test]
    fn exhausts() {
        let mut frames = table(2);
        assert!(frames.allocate_frame().is_some());
        assert!(frames.allocate_frame().is_some());
        assert_eq!(frames.allocate_frame(), None);
    }

    #[test]
    fn double_free_is_ignored() {
        let mut frames = table(2);
        let a = frames.allocate_frame().unwrap();
        frames.free_frame(a);
        frames.free_frame(a);
        assert_eq!(frames.free_frames(), 2);
    }

    #[test]
    fn contiguous_skips_holes() {
        let mut frames = table(6);
        let first = frames.allocate_frame().unwrap();
        let second = frames.allocate_frame().unwrap();
        frames.free_frame(first);
        // Free frames are now 0, 2, 3, 4, 5.
        let run = frames.allocate_contiguous(3).unwrap();
        assert_eq!(run, second + PAGE_SIZE);
        assert_eq!(frames.free_frames(), 2);
        assert_eq!(frames.allocate_contiguous(2), None);
    }

    #[test]
    fn reserved_frames_are_skipped() {
        let mut frames = table(2);
        frames.reserve(PhysicalAddress::new(0x10_0000));
        assert_eq!(frames.free_frames(), 1);
        assert_eq!(
            frames.allocate_frame(),
            Some(PhysicalAddress::new(0x10_0000 + PAGE_SIZE))
        );
    }

    #[test]
    fn release_and_free_waits_for_last_reference() {
        let mut frames = table(1);
        let a = frames.allocate_frame().unwrap();
        frames.reference(a);
        assert!(!frames.release_and_free(a));
        assert!(frames.release_and_free(a));
        assert_eq!(frames.free_frames(), 1);
    }
}

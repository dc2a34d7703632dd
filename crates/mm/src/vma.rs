//! Virtual memory areas.
//!
//! A [`VmaTable`] records which ranges of a user address space are in use, with
//! their access flags and purpose. It is bookkeeping only: callers change the page
//! tables alongside it. Tables hold a few dozen entries at most, so every operation
//! is a linear scan of a fixed array.

use core::fmt;

use bitflags::bitflags;

use crate::{
    PAGE_SIZE, Sharing, VirtualAddress, VmaError,
    arch::PageFlags,
    layout::{FIND_FREE_PROBES, MMAP_BASE, MMAP_LIMIT, VMA_MAX},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const SHARED = 1 << 3;
        const ANON = 1 << 4;
        const GROWSDOWN = 1 << 5;
    }
}

impl VmaFlags {
    /// Returns the entry flags for pages backing an area with these flags.
    pub fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::user(self.contains(Self::WRITE));
        flags.set_no_execute(!self.contains(Self::EXEC));
        if self.contains(Self::SHARED) {
            flags.set_sharing(Sharing::Shared);
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    Anonymous,
    /// Loaded from a program image.
    Image,
    Stack,
    /// The program break heap.
    Break,
}

impl fmt::Display for VmaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Anonymous => "anon",
            Self::Image => "elf",
            Self::Stack => "stack",
            Self::Break => "brk",
        })
    }
}

/// One in-use range `[start, end)`. Both ends are page-aligned and `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: VmaFlags,
    pub kind: VmaKind,
}

impl Vma {
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        start < self.end && self.start < end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn pages(&self) -> usize {
        self.len() / PAGE_SIZE
    }
}

/// Fixed-capacity set of disjoint areas. Cloning produces an independent snapshot.
#[derive(Debug, Clone)]
pub struct VmaTable {
    entries: [Option<Vma>; VMA_MAX],
    count: usize,
    total_mapped: usize,
    next_free: VirtualAddress,
}

impl Default for VmaTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Page-aligns `[start, end)` outward, rejecting empty or inverted ranges.
fn align_range(
    start: VirtualAddress,
    end: VirtualAddress,
) -> Result<(VirtualAddress, VirtualAddress), VmaError> {
    if start >= end {
        return Err(VmaError::InvalidRange);
    }
    Ok((start.align_down(PAGE_SIZE), end.align_up(PAGE_SIZE)))
}

impl VmaTable {
    pub const fn new() -> Self {
        Self {
            entries: [None; VMA_MAX],
            count: 0,
            total_mapped: 0,
            next_free: VirtualAddress::new(MMAP_BASE),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total bytes covered by active areas.
    pub fn total_mapped(&self) -> usize {
        self.total_mapped
    }

    /// The hint where the next anonymous mapping search starts.
    pub fn next_free(&self) -> VirtualAddress {
        self.next_free
    }

    pub fn set_next_free(&mut self, addr: VirtualAddress) {
        self.next_free = addr.align_up(PAGE_SIZE);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.entries.iter().flatten()
    }

    /// Returns the area containing `addr`.
    pub fn find(&self, addr: VirtualAddress) -> Option<&Vma> {
        self.iter().find(|v| v.contains(addr))
    }

    fn free_slot(&self) -> Option<usize> {
        self.entries.iter().position(Option::is_none)
    }

    fn occupy(&mut self, slot: usize, vma: Vma) {
        self.total_mapped += vma.len();
        self.count += 1;
        self.entries[slot] = Some(vma);
    }

    /// Records `[start, end)`, rounded outward to page boundaries.
    pub fn insert(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        flags: VmaFlags,
        kind: VmaKind,
    ) -> Result<(), VmaError> {
        let (start, end) = align_range(start, end)?;
        if self.iter().any(|v| v.overlaps(start, end)) {
            return Err(VmaError::Overlaps);
        }
        let slot = self.free_slot().ok_or(VmaError::TableFull)?;
        self.occupy(
            slot,
            Vma {
                start,
                end,
                flags,
                kind,
            },
        );
        Ok(())
    }

    /// Removes `[start, end)` from the table's coverage, deleting, shrinking or
    /// splitting every area it touches. Returns the number of pages no longer
    /// covered.
    ///
    /// Punching a hole in the middle of an area needs a free slot; if none is left
    /// the table is unchanged and `TableFull` is returned.
    pub fn remove(&mut self, start: VirtualAddress, end: VirtualAddress) -> Result<usize, VmaError> {
        let (start, end) = align_range(start, end)?;
        let punches_hole = self.iter().any(|v| v.start < start && end < v.end);
        if punches_hole && self.free_slot().is_none() {
            return Err(VmaError::TableFull);
        }

        let mut removed = 0;
        for slot in 0..VMA_MAX {
            let Some(vma) = self.entries[slot] else {
                continue;
            };
            if !vma.overlaps(start, end) {
                continue;
            }

            self.total_mapped -= vma.len();
            self.count -= 1;
            self.entries[slot] = None;

            let cut_start = start.max(vma.start);
            let cut_end = end.min(vma.end);
            removed += (cut_end - cut_start) / PAGE_SIZE;

            if vma.start < cut_start {
                self.occupy(
                    slot,
                    Vma {
                        end: cut_start,
                        ..vma
                    },
                );
            }
            if cut_end < vma.end {
                let upper = if self.entries[slot].is_none() {
                    slot
                } else {
                    // Checked above: a hole always has a free slot.
                    self.free_slot().ok_or(VmaError::TableFull)?
                };
                self.occupy(
                    upper,
                    Vma {
                        start: cut_end,
                        ..vma
                    },
                );
            }
        }
        Ok(removed)
    }

    /// Splits the area containing `addr` into `[start, addr)` and `[addr, end)`.
    ///
    /// Returns `Ok(false)` if `addr` is already a boundary or no area contains it.
    pub fn split(&mut self, addr: VirtualAddress) -> Result<bool, VmaError> {
        let addr = addr.align_down(PAGE_SIZE);
        let Some(slot) = self
            .entries
            .iter()
            .position(|e| e.is_some_and(|v| v.contains(addr) && v.start != addr))
        else {
            return Ok(false);
        };
        let upper_slot = self.free_slot().ok_or(VmaError::TableFull)?;
        let Some(vma) = self.entries[slot].as_mut() else {
            return Ok(false);
        };
        let upper = Vma { start: addr, ..*vma };
        vma.end = addr;
        self.entries[upper_slot] = Some(upper);
        self.count += 1;
        Ok(true)
    }

    /// Finds a page-aligned gap of at least `len` bytes at or above the next-free
    /// hint and below [`MMAP_LIMIT`], and moves the hint past it.
    ///
    /// Gives up after [`FIND_FREE_PROBES`] candidates and returns `None`.
    pub fn find_free(&mut self, len: usize) -> Option<VirtualAddress> {
        if len == 0 {
            return None;
        }
        let len = len.checked_next_multiple_of(PAGE_SIZE)?;
        let mut candidate = self.next_free.as_usize();

        for _ in 0..FIND_FREE_PROBES {
            let end = candidate.checked_add(len)?;
            if end > MMAP_LIMIT {
                return None;
            }
            let (start, end) = (VirtualAddress::new(candidate), VirtualAddress::new(end));
            if !self.iter().any(|v| v.overlaps(start, end)) {
                self.next_free = end;
                return Some(start);
            }
            // Skip past whatever area the candidate lands in.
            candidate = self
                .iter()
                .filter(|v| v.contains(start))
                .map(|v| v.end.as_usize())
                .fold(candidate + PAGE_SIZE, usize::max);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: usize) -> VirtualAddress {
        VirtualAddress::new(a)
    }

    fn rw() -> VmaFlags {
        VmaFlags::READ | VmaFlags::WRITE | VmaFlags::ANON
    }

    fn assert_disjoint(table: &VmaTable) {
        let areas: Vec<_> = table.iter().copied().collect();
        for (i, a) in areas.iter().enumerate() {
            assert!(a.start < a.end, "empty area {:?}", a);
            assert!(a.start.is_page_aligned() && a.end.is_page_aligned());
            for b in &areas[i + 1..] {
                assert!(!a.overlaps(b.start, b.end), "{:?} overlaps {:?}", a, b);
            }
        }
        assert_eq!(table.len(), areas.len());
        assert_eq!(table.total_mapped(), areas.iter().map(Vma::len).sum::<usize>());
    }

    #[test]
    fn insert_aligns_outward() {
        let mut table = VmaTable::new();
        table
            .insert(addr(0x1000_0010), addr(0x1000_1001), rw(), VmaKind::Anonymous)
            .unwrap();
        let vma = table.find(addr(0x1000_1800)).unwrap();
        assert_eq!(vma.start, addr(0x1000_0000));
        assert_eq!(vma.end, addr(0x1000_2000));
        assert_eq!(table.total_mapped(), 0x2000);
        assert!(table.find(addr(0x1000_2000)).is_none());
    }

    #[test]
    fn insert_rejects_empty_and_overlapping() {
        let mut table = VmaTable::new();
        assert_eq!(
            table.insert(addr(0x2000), addr(0x2000), rw(), VmaKind::Anonymous),
            Err(VmaError::InvalidRange)
        );
        table
            .insert(addr(0x2000), addr(0x4000), rw(), VmaKind::Anonymous)
            .unwrap();
        assert_eq!(
            table.insert(addr(0x3000), addr(0x5000), rw(), VmaKind::Anonymous),
            Err(VmaError::Overlaps)
        );
    }

    #[test]
    fn insert_fails_when_full() {
        let mut table = VmaTable::new();
        for i in 0..VMA_MAX {
            let start = 0x1000_0000 + i * 2 * PAGE_SIZE;
            table
                .insert(addr(start), addr(start + PAGE_SIZE), rw(), VmaKind::Anonymous)
                .unwrap();
        }
        assert_eq!(
            table.insert(addr(0x3000_0000), addr(0x3000_1000), rw(), VmaKind::Anonymous),
            Err(VmaError::TableFull)
        );
    }

    #[test]
    fn remove_whole_area() {
        let mut table = VmaTable::new();
        table
            .insert(addr(0x2000), addr(0x5000), rw(), VmaKind::Anonymous)
            .unwrap();
        assert_eq!(table.remove(addr(0x1000), addr(0x6000)), Ok(3));
        assert!(table.is_empty());
        assert_eq!(table.total_mapped(), 0);
    }

    #[test]
    fn remove_punches_hole() {
        let mut table = VmaTable::new();
        table
            .insert(addr(0x1000), addr(0x6000), rw(), VmaKind::Image)
            .unwrap();
        assert_eq!(table.remove(addr(0x2000), addr(0x4000)), Ok(2));
        assert_eq!(table.len(), 2);
        let lower = table.find(addr(0x1000)).unwrap();
        assert_eq!((lower.start, lower.end), (addr(0x1000), addr(0x2000)));
        let upper = table.find(addr(0x4000)).unwrap();
        assert_eq!((upper.start, upper.end), (addr(0x4000), addr(0x6000)));
        assert_eq!(upper.kind, VmaKind::Image);
        assert_disjoint(&table);
    }

    #[test]
    fn remove_clips_edges() {
        let mut table = VmaTable::new();
        table
            .insert(addr(0x1000), addr(0x4000), rw(), VmaKind::Anonymous)
            .unwrap();
        table
            .insert(addr(0x6000), addr(0x9000), rw(), VmaKind::Anonymous)
            .unwrap();
        // Clips the right edge of the first and the left edge of the second.
        assert_eq!(table.remove(addr(0x3000), addr(0x7000)), Ok(2));
        assert_eq!(table.find(addr(0x1000)).unwrap().end, addr(0x3000));
        assert_eq!(table.find(addr(0x8000)).unwrap().start, addr(0x7000));
        assert_disjoint(&table);
    }

    #[test]
    fn remove_without_overlap_is_noop() {
        let mut table = VmaTable::new();
        table
            .insert(addr(0x1000), addr(0x2000), rw(), VmaKind::Anonymous)
            .unwrap();
        let before = table.clone();
        assert_eq!(table.remove(addr(0x5000), addr(0x7000)), Ok(0));
        assert_eq!(table.len(), before.len());
        assert_eq!(table.total_mapped(), before.total_mapped());
        assert_eq!(table.find(addr(0x1000)), before.find(addr(0x1000)));
    }

    #[test]
    fn hole_in_full_table_is_refused() {
        let mut table = VmaTable::new();
        for i in 0..VMA_MAX {
            let start = 0x1000_0000 + i * 4 * PAGE_SIZE;
            table
                .insert(addr(start), addr(start + 3 * PAGE_SIZE), rw(), VmaKind::Anonymous)
                .unwrap();
        }
        let mapped = table.total_mapped();
        assert_eq!(
            table.remove(addr(0x1000_1000), addr(0x1000_2000)),
            Err(VmaError::TableFull)
        );
        assert_eq!(table.total_mapped(), mapped);
    }

    #[test]
    fn split_at_boundary_is_noop() {
        let mut table = VmaTable::new();
        table
            .insert(addr(0x1000), addr(0x4000), rw(), VmaKind::Anonymous)
            .unwrap();
        assert_eq!(table.split(addr(0x1000)), Ok(false));
        assert_eq!(table.split(addr(0x8000)), Ok(false));
        assert_eq!(table.split(addr(0x2800)), Ok(true));
        assert_eq!(table.len(), 2);
        assert_eq!(table.find(addr(0x1000)).unwrap().end, addr(0x2000));
        assert_eq!(table.find(addr(0x2000)).unwrap().end, addr(0x4000));
        assert_eq!(table.total_mapped(), 0x3000);
    }

    #[test]
    fn find_free_advances_hint() {
        let mut table = VmaTable::new();
        let first = table.find_free(0x1800).unwrap();
        assert_eq!(first, addr(MMAP_BASE));
        assert_eq!(table.next_free(), addr(MMAP_BASE + 0x2000));
        let second = table.find_free(PAGE_SIZE).unwrap();
        assert_eq!(second, addr(MMAP_BASE + 0x2000));
    }

    #[test]
    fn find_free_skips_areas() {
        let mut table = VmaTable::new();
        table
            .insert(addr(MMAP_BASE), addr(MMAP_BASE + 0x3000), rw(), VmaKind::Anonymous)
            .unwrap();
        table
            .insert(
                addr(MMAP_BASE + 0x4000),
                addr(MMAP_BASE + 0x5000),
                rw(),
                VmaKind::Anonymous,
            )
            .unwrap();
        // The one-page gap at +0x3000 is too small.
        assert_eq!(table.find_free(0x2000), Some(addr(MMAP_BASE + 0x5000)));
    }

    #[test]
    fn find_free_reports_no_space() {
        let mut table = VmaTable::new();
        // Everything from the hint to the limit is taken except one page.
        table
            .insert(addr(MMAP_BASE), addr(MMAP_LIMIT - 0x3000), rw(), VmaKind::Anonymous)
            .unwrap();
        table
            .insert(addr(MMAP_LIMIT - 0x2000), addr(MMAP_LIMIT), rw(), VmaKind::Anonymous)
            .unwrap();
        for _ in 0..3 {
            assert_eq!(table.find_free(0x2000), None);
        }
        assert_eq!(table.next_free(), addr(MMAP_BASE));
        assert_eq!(table.find_free(0), None);
        assert_eq!(table.find_free(PAGE_SIZE), Some(addr(MMAP_LIMIT - 0x3000)));
    }

    #[test]
    fn find_free_walks_past_many_areas() {
        let mut table = VmaTable::new();
        // Alternating one-page areas and one-page gaps.
        for i in 0..VMA_MAX {
            let start = MMAP_BASE + i * 2 * PAGE_SIZE;
            table
                .insert(addr(start), addr(start + PAGE_SIZE), rw(), VmaKind::Anonymous)
                .unwrap();
        }
        let found = table.find_free(2 * PAGE_SIZE).unwrap();
        assert_eq!(found, addr(MMAP_BASE + (2 * VMA_MAX - 1) * PAGE_SIZE));
    }

    #[test]
    fn find_free_gives_up_after_probe_limit() {
        let mut table = VmaTable::new();
        let blocker = MMAP_BASE + 2000 * PAGE_SIZE;
        table
            .insert(addr(blocker), addr(blocker + PAGE_SIZE), rw(), VmaKind::Anonymous)
            .unwrap();
        // Every candidate below the blocker overlaps it and advances one page, so
        // the probe limit runs out long before the free space above it.
        assert_eq!(table.find_free(2048 * PAGE_SIZE), None);
        assert_eq!(table.next_free(), addr(MMAP_BASE));

        table.set_next_free(addr(blocker));
        assert_eq!(
            table.find_free(2048 * PAGE_SIZE),
            Some(addr(blocker + PAGE_SIZE))
        );
    }

    #[test]
    fn operations_preserve_disjointness() {
        let mut table = VmaTable::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = |bound: usize| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed % bound as u64) as usize
        };

        for _ in 0..2000 {
            let start = 0x1000_0000 + next(256) * PAGE_SIZE;
            let end = start + (1 + next(16)) * PAGE_SIZE;
            match next(3) {
                0 => {
                    let _ = table.insert(addr(start), addr(end), rw(), VmaKind::Anonymous);
                }
                1 => {
                    let _ = table.remove(addr(start), addr(end));
                }
                _ => {
                    let _ = table.split(addr(start));
                }
            }
            assert_disjoint(&table);
        }
    }

    #[test]
    fn clone_is_independent() {
        let mut table = VmaTable::new();
        table
            .insert(addr(0x1000), addr(0x3000), rw(), VmaKind::Stack)
            .unwrap();
        let mut copy = table.clone();
        copy.remove(addr(0x1000), addr(0x3000)).unwrap();
        assert!(copy.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn flags_map_to_page_flags() {
        let flags = (VmaFlags::READ | VmaFlags::WRITE | VmaFlags::SHARED).page_flags();
        assert!(flags.is_user() && flags.is_writable() && flags.is_no_execute());
        assert_eq!(flags.sharing(), Sharing::Shared);
        let text = (VmaFlags::READ | VmaFlags::EXEC).page_flags();
        assert!(!text.is_writable() && !text.is_no_execute());
        assert_eq!(text.sharing(), Sharing::Private);
    }
}

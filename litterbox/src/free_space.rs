//! Guest physical space bookkeeping.
//!
//! Guest physical addresses below the window map the host virtual address of
//! the same value, so host mappings in that range are mirrored as used. Host
//! memory above the window, and page tables, get a frame carved out of the
//! remaining free space.
use crate::{
    interval::{IntervalList, VmArea},
    prot::Prot,
    Error, Result,
};
use abyss::addressing::{page_down, page_up, Gpa, Va, PAGE_SIZE};

/// Best-fit allocator over the identity mapped guest physical window.
#[derive(Clone, Debug)]
pub struct FreeSpaceAllocator {
    free: IntervalList,
    used: IntervalList,
    window: usize,
}

impl FreeSpaceAllocator {
    /// Allocator whose whole window is free, except the zero page.
    pub fn new(window: usize) -> Self {
        let window = page_down(window);
        let free = IntervalList::single(VmArea::new(
            PAGE_SIZE,
            window.saturating_sub(PAGE_SIZE),
            Prot::empty(),
        ));
        Self {
            free,
            used: IntervalList::new(),
            window,
        }
    }

    /// End of the window.
    #[inline]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Free ranges.
    pub fn free(&self) -> &IntervalList {
        &self.free
    }

    /// Used ranges.
    pub fn used(&self) -> &IntervalList {
        &self.used
    }

    /// Mark `[start, start + size)` as used. The part above the window is
    /// ignored.
    pub fn reserve(&mut self, start: usize, size: usize) -> Result<()> {
        if start >= self.window {
            return Ok(());
        }
        let end = page_up(start + size).min(self.window);
        let start = page_down(start);
        let area = VmArea::new(start, end - start, Prot::empty());
        self.free.remove(area);
        self.used.insert(area)
    }

    /// Allocate `size` bytes from the smallest free range that fits.
    pub fn malloc(&mut self, size: usize) -> Result<Gpa> {
        let size = page_up(size);
        let best = self
            .free
            .iter()
            .filter(|a| a.size >= size)
            .min_by_key(|a| a.size)
            .copied()
            .ok_or(Error::OutOfGuestPhysical(size))?;
        let taken = VmArea::new(best.start, size, Prot::empty());
        self.free.remove(taken);
        self.used.insert(taken)?;
        Gpa::new(best.start).ok_or(Error::OutOfGuestPhysical(size))
    }

    /// Guest physical address backing the host range `[va, va + size)`.
    ///
    /// Ranges inside the window map to themselves; anything else gets fresh
    /// space.
    pub fn place(&mut self, va: Va, size: usize) -> Result<Gpa> {
        let start = va.into_usize();
        if start + size <= self.window {
            self.reserve(start, size)?;
            Gpa::new(start).ok_or(Error::OutOfGuestPhysical(size))
        } else {
            self.malloc(size)
        }
    }

    /// Deep copy.
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit() {
        let mut fsa = FreeSpaceAllocator::new(0x10_0000);
        // Leave holes of 3, 1 and 2 pages.
        fsa.reserve(0x1000, 0x1000).unwrap();
        fsa.reserve(0x5000, 0x1000).unwrap();
        fsa.reserve(0x7000, 0x1000).unwrap();
        fsa.reserve(0xa000, 0xf6000).unwrap();
        assert_eq!(fsa.malloc(0x1000).unwrap(), Gpa::new(0x6000).unwrap());
        assert_eq!(fsa.malloc(0x1000).unwrap(), Gpa::new(0x8000).unwrap());
        assert_eq!(fsa.malloc(0x1000).unwrap(), Gpa::new(0x9000).unwrap());
        assert_eq!(fsa.malloc(0x3000).unwrap(), Gpa::new(0x2000).unwrap());
        assert!(fsa.free().is_empty());
        assert!(matches!(fsa.malloc(0x1000), Err(Error::OutOfGuestPhysical(0x1000))));
    }

    #[test]
    fn degenerate_windows_have_no_free_space() {
        for window in [0, 0x800, PAGE_SIZE] {
            let mut fsa = FreeSpaceAllocator::new(window);
            assert!(fsa.free().is_empty());
            assert!(matches!(fsa.malloc(1), Err(Error::OutOfGuestPhysical(PAGE_SIZE))));
        }
        let fsa = FreeSpaceAllocator::new(0x2000);
        assert_eq!(fsa.free().total(), PAGE_SIZE);
    }

    #[test]
    fn placement() {
        let mut fsa = FreeSpaceAllocator::new(0x10_0000);
        let low = fsa.place(Va::new(0x4000).unwrap(), 0x2000).unwrap();
        assert_eq!(low, Gpa::new(0x4000).unwrap());
        let high = fsa.place(Va::new(0x7f00_0000_0000).unwrap(), 0x1000).unwrap();
        assert_eq!(high, Gpa::new(0x1000).unwrap());

        let copy = fsa.copy();
        fsa.malloc(0x1000).unwrap();
        assert_ne!(copy.free().total(), fsa.free().total());
        copy.used().check_canonical().unwrap();
    }
}

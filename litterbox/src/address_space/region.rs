//! Memory regions of an address space.
use crate::{prot::Prot, Error, Result};
use abyss::addressing::{Gpa, PAGE_SIZE};

/// How a region may change over its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Read-only or executable memory; pages only disappear.
    Immutable,
    /// The runtime heap; pages come and go.
    Heap,
    /// Writable memory that grows by new regions.
    Extensible,
}

impl RegionKind {
    #[inline]
    fn tracks_pages(self) -> bool {
        !matches!(self, RegionKind::Extensible)
    }
}

/// A host range mapped at a fixed guest physical address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: RegionKind,
    pub start: usize,
    pub size: usize,
    pub prot: Prot,
    pub gpa: Gpa,
    /// One bit per page; absent for extensible regions.
    bitmap: Option<Vec<u64>>,
}

impl MemoryRegion {
    /// A region whose pages are all `present`.
    pub fn new(kind: RegionKind, start: usize, size: usize, prot: Prot, gpa: Gpa, present: bool) -> Self {
        let pages = size / PAGE_SIZE;
        let bitmap = kind.tracks_pages().then(|| {
            let mut bits = vec![if present { u64::MAX } else { 0 }; (pages + 63) / 64];
            if present && pages % 64 != 0 {
                if let Some(last) = bits.last_mut() {
                    *last = (1u64 << (pages % 64)) - 1;
                }
            }
            bits
        });
        Self {
            kind,
            start,
            size,
            prot,
            gpa,
            bitmap,
        }
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end()
    }

    #[inline]
    pub fn intersects(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end()
    }

    /// Guest physical address backing `addr`.
    #[inline]
    pub fn gpa_of(&self, addr: usize) -> Gpa {
        self.gpa + (addr - self.start)
    }

    /// Whether the page containing `addr` is present. Extensible regions are
    /// present as a whole.
    pub fn is_present(&self, addr: usize) -> bool {
        if !self.contains(addr) {
            return false;
        }
        match &self.bitmap {
            Some(bits) => {
                let page = (addr - self.start) / PAGE_SIZE;
                bits[page / 64] & (1 << (page % 64)) != 0
            }
            None => true,
        }
    }

    /// Mark the pages of `[start, start + size)` that fall into this region.
    pub fn set_present(&mut self, start: usize, size: usize, present: bool) -> Result<()> {
        let (region_start, region_end) = (self.start, self.end());
        let bits = self.bitmap.as_mut().ok_or(Error::Unmapped(start))?;
        let from = start.max(region_start);
        let to = (start + size).min(region_end);
        let mut addr = from;
        while addr < to {
            let page = (addr - region_start) / PAGE_SIZE;
            if present {
                bits[page / 64] |= 1 << (page % 64);
            } else {
                bits[page / 64] &= !(1 << (page % 64));
            }
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Maximal runs of present pages, as `(start, size)`.
    pub fn present_runs(&self) -> Vec<(usize, usize)> {
        let mut runs = Vec::new();
        let mut run: Option<usize> = None;
        let mut addr = self.start;
        while addr < self.end() {
            match (self.is_present(addr), run) {
                (true, None) => run = Some(addr),
                (false, Some(s)) => {
                    runs.push((s, addr - s));
                    run = None;
                }
                _ => {}
            }
            addr += PAGE_SIZE;
        }
        if let Some(s) = run {
            runs.push((s, self.end() - s));
        }
        runs
    }

    /// Cut the region at `addr`, keeping the head and returning the tail.
    pub fn split_at(&mut self, addr: usize) -> MemoryRegion {
        debug_assert!(self.contains(addr) && addr != self.start);
        let head_pages = (addr - self.start) / PAGE_SIZE;
        let tail_size = self.end() - addr;
        let tail_bitmap = self.bitmap.as_ref().map(|bits| {
            let tail_pages = tail_size / PAGE_SIZE;
            let mut tail = vec![0u64; (tail_pages + 63) / 64];
            for i in 0..tail_pages {
                let src = head_pages + i;
                if bits[src / 64] & (1 << (src % 64)) != 0 {
                    tail[i / 64] |= 1 << (i % 64);
                }
            }
            tail
        });
        if let Some(bits) = self.bitmap.as_mut() {
            bits.truncate((head_pages + 63) / 64);
            if head_pages % 64 != 0 {
                if let Some(last) = bits.last_mut() {
                    *last &= (1u64 << (head_pages % 64)) - 1;
                }
            }
        }
        let tail = MemoryRegion {
            kind: self.kind,
            start: addr,
            size: tail_size,
            prot: self.prot,
            gpa: self.gpa_of(addr),
            bitmap: tail_bitmap,
        };
        self.size = addr - self.start;
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_split() {
        let gpa = Gpa::new(0x10_0000).unwrap();
        let mut r = MemoryRegion::new(RegionKind::Heap, 0x40_0000, 100 * PAGE_SIZE, Prot::RW, gpa, true);
        r.set_present(0x40_0000 + 70 * PAGE_SIZE, 2 * PAGE_SIZE, false).unwrap();
        assert!(!r.is_present(0x40_0000 + 71 * PAGE_SIZE));
        assert!(r.is_present(0x40_0000 + 99 * PAGE_SIZE));
        assert!(!r.is_present(0x40_0000 + 100 * PAGE_SIZE));

        let tail = r.split_at(0x40_0000 + 65 * PAGE_SIZE);
        assert_eq!(r.size, 65 * PAGE_SIZE);
        assert_eq!(tail.gpa, gpa + 65 * PAGE_SIZE);
        assert_eq!(
            tail.present_runs(),
            vec![
                (0x40_0000 + 65 * PAGE_SIZE, 5 * PAGE_SIZE),
                (0x40_0000 + 72 * PAGE_SIZE, 28 * PAGE_SIZE)
            ]
        );
        assert_eq!(r.present_runs(), vec![(0x40_0000, 65 * PAGE_SIZE)]);
    }

    #[test]
    fn extensible_has_no_bitmap() {
        let mut r = MemoryRegion::new(RegionKind::Extensible, 0x1000, 0x2000, Prot::RW, Gpa::ZERO, true);
        assert!(r.is_present(0x2fff));
        assert!(matches!(r.set_present(0x1000, 0x1000, false), Err(Error::Unmapped(_))));
    }
}

//! Interval model of an address layout.
//!
//! An [`IntervalList`] keeps [`VmArea`]s sorted by start address. Nodes never
//! overlap, and neighbours that touch with the same protection are always
//! merged into one, so every layout has exactly one representation.
//!
//! Nodes live in an index-based arena; `prev`/`next` links are slot indices.
use crate::{prot::Prot, Error, Result};

/// A contiguous range of memory with a single protection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmArea {
    pub start: usize,
    pub size: usize,
    pub prot: Prot,
}

impl VmArea {
    #[inline]
    pub const fn new(start: usize, size: usize, prot: Prot) -> Self {
        Self { start, size, prot }
    }

    /// Exclusive end.
    #[inline]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end()
    }

    /// Whether the two ranges share at least one byte.
    #[inline]
    pub const fn intersect(&self, other: &VmArea) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Whether one range ends exactly where the other begins.
    #[inline]
    pub const fn contiguous(&self, other: &VmArea) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Absorb `other` into `self`.
    ///
    /// Returns `Ok(false)` when the areas neither intersect nor touch, or when
    /// they only touch with different protections. Intersecting areas with
    /// different protections are an error.
    pub fn merge(&mut self, other: &VmArea) -> Result<bool> {
        if self.intersect(other) {
            if self.prot != other.prot {
                return Err(self.conflict(other));
            }
        } else if !self.contiguous(other) || self.prot != other.prot {
            return Ok(false);
        }
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        self.start = start;
        self.size = end - start;
        Ok(true)
    }

    pub(crate) fn conflict(&self, other: &VmArea) -> Error {
        Error::InconsistentOverlap {
            a_start: self.start,
            a_end: self.end(),
            a_prot: self.prot,
            b_start: other.start,
            b_end: other.end(),
            b_prot: other.prot,
        }
    }
}

impl core::fmt::Debug for VmArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[0x{:x}, 0x{:x}) {:?}", self.start, self.end(), self.prot)
    }
}

#[derive(Clone, Debug)]
struct Node {
    area: VmArea,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Sorted, coalesced list of [`VmArea`]s.
#[derive(Clone, Default)]
pub struct IntervalList {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl IntervalList {
    pub fn new() -> Self {
        Self::default()
    }

    /// List holding only `area`, or nothing when it is empty.
    pub fn single(area: VmArea) -> Self {
        let mut list = Self::new();
        if area.size != 0 {
            list.link_after(None, area);
        }
        list
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Areas in address order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.head,
        }
    }

    /// The area containing `addr`.
    pub fn find(&self, addr: usize) -> Option<&VmArea> {
        self.iter()
            .take_while(|a| a.start <= addr)
            .find(|a| a.contains(addr))
    }

    /// Whether every byte of `[start, start + size)` is covered.
    pub fn covers(&self, start: usize, size: usize) -> bool {
        let end = start + size;
        let mut cursor = start;
        for area in self.iter() {
            if cursor >= end {
                break;
            }
            if area.end() <= cursor {
                continue;
            }
            if area.start > cursor {
                return false;
            }
            cursor = area.end();
        }
        cursor >= end
    }

    /// Total number of bytes covered.
    pub fn total(&self) -> usize {
        self.iter().map(|a| a.size).sum()
    }

    #[inline]
    fn node(&self, idx: usize) -> &Node {
        self.slots[idx].as_ref().expect("dangling interval node")
    }

    #[inline]
    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.slots[idx].as_mut().expect("dangling interval node")
    }

    fn alloc(&mut self, node: Node) -> usize {
        self.len += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    /// Link a new node right after `prev`, or at the head.
    fn link_after(&mut self, prev: Option<usize>, area: VmArea) -> usize {
        let next = match prev {
            Some(p) => self.node(p).next,
            None => self.head,
        };
        let idx = self.alloc(Node { area, prev, next });
        match prev {
            Some(p) => self.node_mut(p).next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(n) => self.node_mut(n).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let Node { prev, next, .. } = self.slots[idx].take().expect("dangling interval node");
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        self.free.push(idx);
        self.len -= 1;
    }

    /// Insert `area` and coalesce it with its neighbours.
    ///
    /// Fails without touching the list if `area` overlaps a node with a
    /// different protection.
    pub fn insert(&mut self, area: VmArea) -> Result<()> {
        if area.size == 0 {
            return Ok(());
        }
        let mut prev = None;
        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = self.node(idx);
            if node.area.start >= area.end() {
                break;
            }
            if node.area.intersect(&area) && node.area.prot != area.prot {
                return Err(node.area.conflict(&area));
            }
            if node.area.start <= area.start {
                prev = Some(idx);
            }
            cur = node.next;
        }

        let new = self.link_after(prev, area);
        let mut cur = prev.unwrap_or(new);
        let mut past_new = prev.is_none();
        while let Some(next) = self.node(cur).next {
            let next_area = self.node(next).area;
            if self.node_mut(cur).area.merge(&next_area)? {
                past_new |= next == new;
                self.unlink(next);
            } else if past_new {
                break;
            } else {
                cur = next;
                past_new = true;
            }
        }
        Ok(())
    }

    /// Remove `[area.start, area.end())` from every node it covers.
    ///
    /// Protection of `area` is ignored.
    pub fn remove(&mut self, area: VmArea) {
        if area.size == 0 {
            return;
        }
        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = self.node(idx).area;
            let next = self.node(idx).next;
            if node.start >= area.end() {
                break;
            }
            if node.intersect(&area) {
                let left = node.start < area.start;
                let right = node.end() > area.end();
                match (left, right) {
                    // Fully covered.
                    (false, false) => self.unlink(idx),
                    // Sticks out to the left: keep the head.
                    (true, false) => self.node_mut(idx).area.size = area.start - node.start,
                    // Covers the whole range: split in two.
                    (true, true) => {
                        self.node_mut(idx).area.size = area.start - node.start;
                        self.link_after(
                            Some(idx),
                            VmArea::new(area.end(), node.end() - area.end(), node.prot),
                        );
                        break;
                    }
                    // Sticks out to the right: keep the tail.
                    (false, true) => {
                        let n = &mut self.node_mut(idx).area;
                        n.start = area.end();
                        n.size = node.end() - area.end();
                    }
                }
            }
            cur = next;
        }
    }

    /// Verify ordering, disjointness and coalescing.
    pub fn check_canonical(&self) -> Result<()> {
        let mut last: Option<VmArea> = None;
        let mut count = 0;
        for area in self.iter() {
            if area.size == 0 {
                return Err(Error::NotCanonical(area.start));
            }
            if let Some(prev) = last {
                if prev.end() > area.start || (prev.end() == area.start && prev.prot == area.prot)
                {
                    return Err(Error::NotCanonical(area.start));
                }
            }
            last = Some(*area);
            count += 1;
        }
        if count != self.len {
            return Err(Error::NotCanonical(0));
        }
        Ok(())
    }
}

impl core::fmt::Debug for IntervalList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a IntervalList {
    type Item = &'a VmArea;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the areas of an [`IntervalList`].
pub struct Iter<'a> {
    list: &'a IntervalList,
    cur: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a VmArea;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.list.node(self.cur?);
        self.cur = node.next;
        Some(&node.area)
    }
}

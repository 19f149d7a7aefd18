//! Generic page table walk.
use super::{Level, NodeHandle, PageTableAllocator, PageTableEntry, PteFlags};
use crate::{free_space::FreeSpaceAllocator, Result};
use abyss::addressing::{Gpa, PAGE_MASK};

/// Action applied by [`PageTable::walk`] to each entry covering a range.
pub trait PageVisitor {
    /// Whether absent entries are populated.
    fn create(&self) -> bool;

    /// Whether [`visit`](PageVisitor::visit) runs on present entries at `level`.
    fn applies(&self, level: Level) -> bool;

    /// Frame backing the 4-KByte page at `va`, installed into an absent leaf.
    /// `None` leaves the entry absent.
    fn leaf_frame(&mut self, _va: usize) -> Option<Gpa> {
        None
    }

    /// Inspect or update a present entry mapping `va` at `level`.
    fn visit(&mut self, entry: &mut PageTableEntry, level: Level, va: usize);
}

/// A page table tree and the storage of its nodes.
pub struct PageTable {
    alloc: PageTableAllocator,
    root: NodeHandle,
}

impl PageTable {
    /// Empty tree with a single root node.
    pub fn new(pages_per_arena: usize, fsa: &mut FreeSpaceAllocator) -> Result<Self> {
        let mut alloc = PageTableAllocator::new(pages_per_arena);
        let root = alloc.alloc(fsa)?;
        Ok(Self { alloc, root })
    }

    /// Guest physical address of the root, for cr3.
    pub fn root_gpa(&self) -> Gpa {
        self.alloc.gpa_of(self.root)
    }

    pub fn allocator(&self) -> &PageTableAllocator {
        &self.alloc
    }

    pub fn allocator_mut(&mut self) -> &mut PageTableAllocator {
        &mut self.alloc
    }

    /// Run `visitor` over every entry covering `[start, end)`, top-down.
    ///
    /// For each covered index: an absent entry is populated if the visitor
    /// creates, a present entry is visited if the visitor applies to the
    /// level, and the walk descends into interior entries.
    pub fn walk<V: PageVisitor + ?Sized>(
        &mut self,
        fsa: &mut FreeSpaceAllocator,
        start: usize,
        end: usize,
        visitor: &mut V,
    ) -> Result<()> {
        let start = start & !PAGE_MASK;
        if start >= end {
            return Ok(());
        }
        Self::walk_node(&mut self.alloc, fsa, self.root, Level::Pml4, 0, start, end, visitor)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_node<V: PageVisitor + ?Sized>(
        alloc: &mut PageTableAllocator,
        fsa: &mut FreeSpaceAllocator,
        node: NodeHandle,
        level: Level,
        base: usize,
        start: usize,
        end: usize,
        visitor: &mut V,
    ) -> Result<()> {
        let span = level.entry_span();
        let first = (start.max(base) - base) / span;
        let last = ((end - 1).min(base + span * super::ENTRIES - 1) - base) / span;

        for idx in first..=last {
            let va = base + idx * span;
            let mut entry = alloc.table(node)[idx];

            if !entry.is_present() {
                if !visitor.create() {
                    continue;
                }
                match level.child() {
                    Some(_) => {
                        let child = alloc.alloc(fsa)?;
                        entry = PageTableEntry::new(alloc.gpa_of(child), PteFlags::DEFAULT_INTERIOR);
                    }
                    None => match visitor.leaf_frame(va) {
                        Some(frame) => entry = PageTableEntry::new(frame, PteFlags::P),
                        None => continue,
                    },
                }
            }

            if visitor.applies(level) {
                visitor.visit(&mut entry, level, va);
            }
            alloc.table_mut(node)[idx] = entry;

            if let (Some(child_level), Some(gpa)) = (level.child(), entry.gpa()) {
                if entry.flags().contains(PteFlags::PS) {
                    continue;
                }
                if let Some(child) = alloc.node_at(gpa) {
                    Self::walk_node(alloc, fsa, child, child_level, va, start, end, visitor)?;
                }
            }
        }
        Ok(())
    }

    /// Leaf entry mapping `va`, if every level is present.
    pub fn translate(&self, va: usize) -> Option<PageTableEntry> {
        let mut node = self.root;
        for level in Level::TOP_DOWN {
            let entry = self.alloc.table(node)[level.index(va)];
            if !entry.is_present() {
                return None;
            }
            if level == Level::Pt {
                return Some(entry);
            }
            node = self.alloc.node_at(entry.gpa()?)?;
        }
        None
    }
}

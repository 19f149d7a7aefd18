//! Arena storage for page table nodes.
use super::{PageTableEntry, ENTRIES};
use crate::{free_space::FreeSpaceAllocator, Result};
use abyss::{
    addressing::{Gpa, Va, PAGE_SIZE},
    mm::Pages,
};

/// Typed reference to a table node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    arena: u32,
    index: u32,
}

/// Host and guest placement of an arena, for memory slot registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaSpan {
    pub va: Va,
    pub gpa: Gpa,
    pub size: usize,
}

struct Arena {
    pages: Pages,
    gpa: Gpa,
    used: usize,
}

impl Arena {
    #[inline]
    fn is_full(&self) -> bool {
        self.used == self.pages.count()
    }

    fn span(&self) -> ArenaSpan {
        ArenaSpan {
            va: self.pages.va(),
            gpa: self.gpa,
            size: self.pages.len(),
        }
    }
}

/// Hands out zeroed table nodes from batches of mmap'd pages.
///
/// Nodes are never freed individually; the allocator only grows.
pub struct PageTableAllocator {
    arenas: Vec<Arena>,
    pages_per_arena: usize,
}

impl PageTableAllocator {
    pub fn new(pages_per_arena: usize) -> Self {
        Self {
            arenas: Vec::new(),
            pages_per_arena: pages_per_arena.max(1),
        }
    }

    /// Allocate a zeroed node. A new arena takes its guest physical space
    /// from `fsa`.
    pub fn alloc(&mut self, fsa: &mut FreeSpaceAllocator) -> Result<NodeHandle> {
        if self.arenas.last().map_or(true, Arena::is_full) {
            let pages = Pages::new(self.pages_per_arena)?;
            let gpa = fsa.place(pages.va(), pages.len())?;
            tracing::debug!(va = %pages.va(), %gpa, pages = self.pages_per_arena, "new page table arena");
            self.arenas.push(Arena {
                pages,
                gpa,
                used: 0,
            });
        }
        let arena = self.arenas.len() - 1;
        let a = &mut self.arenas[arena];
        let index = a.used;
        a.used += 1;
        Ok(NodeHandle {
            arena: arena as u32,
            index: index as u32,
        })
    }

    /// Number of nodes handed out.
    pub fn nodes(&self) -> usize {
        self.arenas.iter().map(|a| a.used).sum()
    }

    /// Entries of `node`.
    pub fn table(&self, node: NodeHandle) -> &[PageTableEntry; ENTRIES] {
        let ptr = self.arenas[node.arena as usize].pages.page_ptr(node.index as usize);
        // Each node is one zero-initialized page owned by this allocator.
        unsafe { &*(ptr as *const [PageTableEntry; ENTRIES]) }
    }

    /// Mutable entries of `node`.
    pub fn table_mut(&mut self, node: NodeHandle) -> &mut [PageTableEntry; ENTRIES] {
        let ptr = self.arenas[node.arena as usize].pages.page_ptr(node.index as usize);
        unsafe { &mut *(ptr as *mut [PageTableEntry; ENTRIES]) }
    }

    /// Guest physical address of `node`.
    pub fn gpa_of(&self, node: NodeHandle) -> Gpa {
        self.arenas[node.arena as usize].gpa + node.index as usize * PAGE_SIZE
    }

    /// Node whose guest physical address is `gpa`.
    pub fn node_at(&self, gpa: Gpa) -> Option<NodeHandle> {
        self.arenas.iter().enumerate().find_map(|(i, a)| {
            let off = gpa.into_usize().checked_sub(a.gpa.into_usize())?;
            let index = off / PAGE_SIZE;
            (off % PAGE_SIZE == 0 && index < a.used).then(|| NodeHandle {
                arena: i as u32,
                index: index as u32,
            })
        })
    }

    /// Every arena.
    pub fn arenas(&self) -> impl Iterator<Item = ArenaSpan> + '_ {
        self.arenas.iter().map(Arena::span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arenas_fill_then_grow() {
        let mut fsa = FreeSpaceAllocator::new(1 << 39);
        let mut alloc = PageTableAllocator::new(2);
        let a = alloc.alloc(&mut fsa).unwrap();
        let b = alloc.alloc(&mut fsa).unwrap();
        assert_eq!(alloc.arenas().count(), 1);
        let c = alloc.alloc(&mut fsa).unwrap();
        assert_eq!(alloc.arenas().count(), 2);
        assert_eq!(alloc.nodes(), 3);

        assert_eq!(alloc.gpa_of(b), alloc.gpa_of(a) + PAGE_SIZE);
        for node in [a, b, c] {
            assert_eq!(alloc.node_at(alloc.gpa_of(node)), Some(node));
            assert!(alloc.table(node).iter().all(|e| !e.is_present()));
        }
        alloc.table_mut(c)[3] = PageTableEntry(0x1003);
        assert!(alloc.table(c)[3].is_present());
        assert_eq!(alloc.node_at(alloc.gpa_of(a) + 0x800), None);
    }
}

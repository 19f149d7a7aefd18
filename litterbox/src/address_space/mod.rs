//! Address spaces of guest domains.
//!
//! The template ("God") space mirrors the whole process. A domain space is a
//! copy of it with every extent the domain's view does not grant removed and
//! every granted extent restricted to its effective protection; it is then
//! materialized into page tables.
mod region;

pub use region::{MemoryRegion, RegionKind};

use crate::{
    config::Config,
    engine::IsolationEngine,
    free_space::FreeSpaceAllocator,
    package::SandboxDomain,
    page_table::{Level, PageTable, PageTableEntry, PageVisitor, PteFlags},
    prot::Prot,
    Error, Result,
};
use abyss::{
    addressing::{page_down, page_up, Gpa, Va},
    mm::MemoryMap,
};

/// Host range backed at a guest physical address, as registered with the
/// hypervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub va: Va,
    pub gpa: Gpa,
    pub size: usize,
}

/// Leaf flags for memory with protection `prot`.
pub fn leaf_flags(prot: Prot) -> PteFlags {
    let mut flags = PteFlags::P;
    if prot.contains(Prot::W) {
        flags |= PteFlags::RW;
    }
    if prot.contains(Prot::USER) {
        flags |= PteFlags::US;
    }
    if !prot.contains(Prot::X) {
        flags |= PteFlags::XD;
    }
    flags
}

/// Installs the present pages of a region.
struct Materialize<'a> {
    region: &'a MemoryRegion,
    prot: Prot,
}

impl PageVisitor for Materialize<'_> {
    fn create(&self) -> bool {
        true
    }

    fn applies(&self, _level: Level) -> bool {
        true
    }

    fn leaf_frame(&mut self, va: usize) -> Option<Gpa> {
        (!self.prot.access().is_empty() && self.region.is_present(va))
            .then(|| self.region.gpa_of(va))
    }

    fn visit(&mut self, entry: &mut PageTableEntry, level: Level, va: usize) {
        if level != Level::Pt {
            entry.set_flags(entry.flags() | PteFlags::DEFAULT_INTERIOR);
        } else if self.region.contains(va) {
            entry.set_flags(leaf_flags(self.prot));
        }
    }
}

/// Clears the leaves of a range.
struct Unmap;

impl PageVisitor for Unmap {
    fn create(&self) -> bool {
        false
    }

    fn applies(&self, level: Level) -> bool {
        level == Level::Pt
    }

    fn visit(&mut self, entry: &mut PageTableEntry, _level: Level, _va: usize) {
        entry.clear();
    }
}

/// Regions, guest physical space and page tables of one domain.
pub struct AddressSpace {
    regions: Vec<MemoryRegion>,
    fsa: FreeSpaceAllocator,
    page_table: Option<PageTable>,
    arena_pages: usize,
}

impl AddressSpace {
    /// Space with no regions.
    pub fn empty(config: &Config) -> Self {
        Self {
            regions: Vec::new(),
            fsa: FreeSpaceAllocator::new(config.window()),
            page_table: None,
            arena_pages: config.arena_pages,
        }
    }

    /// Mirror the process address map.
    ///
    /// Read-only and executable mappings become immutable regions, the
    /// configured heap becomes a heap region, and the remaining writable
    /// mappings become extensible regions. Nothing below the low boundary is
    /// kept.
    pub fn template(map: &MemoryMap, config: &Config) -> Result<Self> {
        let mut space = Self::empty(config);
        for e in &map.entries {
            space.fsa.reserve(e.start, e.size())?;
        }
        if let Some(heap) = config.heap {
            let start = page_down(heap.start);
            let size = page_up(heap.start + heap.size) - start;
            let va = Va::new(start).ok_or(Error::Unmapped(start))?;
            let gpa = space.fsa.place(va, size)?;
            let mut region = MemoryRegion::new(RegionKind::Heap, start, size, Prot::RW | Prot::USER, gpa, false);
            for e in map.entries.iter().filter(|e| e.read || e.write) {
                region.set_present(e.start, e.size(), true)?;
            }
            space.insert_region(region);
        }
        for e in &map.entries {
            if e.is_special() || e.start < config.low_boundary || !(e.read || e.write || e.exec) {
                continue;
            }
            let mut prot = Prot::USER;
            prot.set(Prot::R, e.read);
            prot.set(Prot::W, e.write);
            prot.set(Prot::X, e.exec);
            let kind = if !e.write || e.exec {
                RegionKind::Immutable
            } else {
                RegionKind::Extensible
            };
            for (start, size) in space.uncovered(e.start, e.end) {
                let va = Va::new(start).ok_or(Error::Unmapped(start))?;
                let gpa = space.fsa.place(va, size)?;
                space.insert_region(MemoryRegion::new(kind, start, size, prot, gpa, true));
            }
        }
        tracing::debug!(regions = space.regions.len(), "template address space");
        Ok(space)
    }

    /// Deep copy of the regions and the guest physical bookkeeping. Page
    /// tables are not copied.
    pub fn copy(&self) -> Self {
        Self {
            regions: self.regions.clone(),
            fsa: self.fsa.copy(),
            page_table: None,
            arena_pages: self.arena_pages,
        }
    }

    /// Copy of `template` narrowed to `domain` and materialized.
    pub fn apply_domain(
        template: &AddressSpace,
        engine: &IsolationEngine,
        domain: &SandboxDomain,
    ) -> Result<Self> {
        let mut space = template.copy();
        space.narrow(engine, domain)?;
        space.finalize()?;
        tracing::debug!(domain = %domain.id, regions = space.regions.len(), "domain address space");
        Ok(space)
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn free_space_mut(&mut self) -> &mut FreeSpaceAllocator {
        &mut self.fsa
    }

    pub fn page_table(&self) -> Option<&PageTable> {
        self.page_table.as_ref()
    }

    fn insert_region(&mut self, region: MemoryRegion) {
        let at = self.regions.partition_point(|r| r.start < region.start);
        self.regions.insert(at, region);
    }

    /// Sub-ranges of `[start, end)` that no region covers.
    fn uncovered(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut gaps = Vec::new();
        let mut cursor = start;
        for r in self.regions.iter().filter(|r| r.intersects(start, end)) {
            if r.start > cursor {
                gaps.push((cursor, r.start - cursor));
            }
            cursor = cursor.max(r.end());
        }
        if cursor < end {
            gaps.push((cursor, end - cursor));
        }
        gaps
    }

    /// Make `addr` a region boundary if it falls inside a region.
    fn split_at(&mut self, addr: usize) {
        if let Some(i) = self
            .regions
            .iter()
            .position(|r| r.contains(addr) && r.start != addr)
        {
            let tail = self.regions[i].split_at(addr);
            self.regions.insert(i + 1, tail);
        }
    }

    /// Revoke `[start, start + size)`: page tracking regions lose the pages,
    /// extensible regions lose the range.
    pub fn remove(&mut self, start: usize, size: usize) -> Result<()> {
        let (start, end) = (page_up(start), page_down(start + size));
        if start >= end {
            return Ok(());
        }
        if self
            .regions
            .iter()
            .any(|r| r.kind == RegionKind::Extensible && r.intersects(start, end))
        {
            self.split_at(start);
            self.split_at(end);
        }
        for r in self
            .regions
            .iter_mut()
            .filter(|r| r.kind != RegionKind::Extensible && r.intersects(start, end))
        {
            r.set_present(start, end - start, false)?;
        }
        self.regions
            .retain(|r| r.kind != RegionKind::Extensible || !r.intersects(start, end));
        Ok(())
    }

    /// Intersect the protection of `[start, start + size)` with `grant`.
    pub fn restrict(&mut self, start: usize, size: usize, grant: Prot) {
        let (start, end) = (page_up(start), page_down(start + size));
        if start >= end {
            return;
        }
        self.split_at(start);
        self.split_at(end);
        for r in self.regions.iter_mut().filter(|r| r.intersects(start, end)) {
            r.prot = r.prot.restrict(grant);
        }
    }

    /// Apply the view of `domain` to this space.
    pub fn narrow(&mut self, engine: &IsolationEngine, domain: &SandboxDomain) -> Result<()> {
        if self.page_table.is_some() {
            return Err(Error::Unsupported("narrowing a materialized address space"));
        }
        for pkg in engine.packages() {
            let grant = domain.grant(pkg.id);
            for extent in pkg.extents() {
                if grant.access().is_empty() {
                    self.remove(extent.start, extent.size)?;
                } else if grant & Prot::ALL != Prot::ALL {
                    self.restrict(extent.start, extent.size, grant);
                }
            }
        }
        Ok(())
    }

    /// Build the page tables of every region.
    pub fn finalize(&mut self) -> Result<()> {
        let mut pt = PageTable::new(self.arena_pages, &mut self.fsa)?;
        for region in &self.regions {
            let mut visitor = Materialize {
                region,
                prot: region.prot,
            };
            pt.walk(&mut self.fsa, region.start, region.end(), &mut visitor)?;
        }
        tracing::debug!(
            root = %pt.root_gpa(),
            nodes = pt.allocator().nodes(),
            "address space materialized"
        );
        self.page_table = Some(pt);
        Ok(())
    }

    /// Whether `addr` is mapped and present.
    pub fn valid_address(&self, addr: usize) -> bool {
        self.regions.iter().any(|r| r.is_present(addr))
    }

    /// Mark heap pages of `[start, start + size)` present with `prot`, or
    /// absent, keeping the page tables in sync.
    ///
    /// The range must lie in page tracking regions only; otherwise nothing
    /// changes and the error is [`Error::Unmapped`].
    pub fn toggle_dyn(&mut self, start: usize, size: usize, present: bool, prot: Prot) -> Result<()> {
        if start % abyss::addressing::PAGE_SIZE != 0 {
            return Err(Error::Unaligned(start));
        }
        let end = page_up(start + size);
        let idx: Vec<usize> = self
            .regions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.intersects(start, end))
            .map(|(i, _)| i)
            .collect();
        if idx.is_empty()
            || !self.uncovered(start, end).is_empty()
            || idx.iter().any(|i| self.regions[*i].kind == RegionKind::Extensible)
        {
            return Err(Error::Unmapped(start));
        }
        for i in idx {
            self.regions[i].set_present(start, end - start, present)?;
            if let Some(pt) = self.page_table.as_mut() {
                let region = &self.regions[i];
                let (from, to) = (start.max(region.start), end.min(region.end()));
                if present {
                    let mut visitor = Materialize { region, prot };
                    pt.walk(&mut self.fsa, from, to, &mut visitor)?;
                } else {
                    pt.walk(&mut self.fsa, from, to, &mut Unmap)?;
                }
            }
        }
        Ok(())
    }

    /// Add extensible regions for the parts of `[start, start + size)` not
    /// covered yet, map them if materialized, and return them.
    pub fn extend(&mut self, start: usize, size: usize, prot: Prot) -> Result<Vec<MemoryRegion>> {
        let (start, end) = (page_down(start), page_up(start + size));
        let mut added = Vec::new();
        for (s, len) in self.uncovered(start, end) {
            let va = Va::new(s).ok_or(Error::Unmapped(s))?;
            let gpa = self.fsa.place(va, len)?;
            let region = MemoryRegion::new(RegionKind::Extensible, s, len, prot, gpa, true);
            if let Some(pt) = self.page_table.as_mut() {
                let mut visitor = Materialize {
                    region: &region,
                    prot,
                };
                pt.walk(&mut self.fsa, s, s + len, &mut visitor)?;
            }
            self.insert_region(region.clone());
            added.push(region);
        }
        Ok(added)
    }

    /// [`AddressSpace::remove`], clearing the page table entries as well.
    pub fn revoke(&mut self, start: usize, size: usize) -> Result<()> {
        self.remove(start, size)?;
        let (from, to) = (page_up(start), page_down(start + size));
        if let Some(pt) = self.page_table.as_mut() {
            if from < to {
                pt.walk(&mut self.fsa, from, to, &mut Unmap)?;
            }
        }
        Ok(())
    }

    /// Give `[start, start + size)` protection `prot`, or take it away when
    /// `prot` grants no access. Heap pages are toggled; anything else is
    /// recreated as an extensible region.
    pub fn assign(&mut self, start: usize, size: usize, prot: Prot) -> Result<()> {
        if prot.access().is_empty() {
            return self.revoke(start, size);
        }
        match self.toggle_dyn(start, size, true, prot) {
            Err(Error::Unmapped(_)) => {
                self.revoke(start, size)?;
                self.extend(start, size, prot).map(|_| ())
            }
            r => r,
        }
    }

    /// Runtime growth of the heap: the range becomes a fresh extensible
    /// region with `prot`, even one granting no access, so that every space
    /// knows about it. Pages of page tracking regions are toggled instead.
    pub fn grow(&mut self, start: usize, size: usize, prot: Prot) -> Result<()> {
        match self.toggle_dyn(start, size, !prot.access().is_empty(), prot) {
            Err(Error::Unmapped(_)) => {
                self.revoke(start, size)?;
                self.extend(start, size, prot).map(|_| ())
            }
            r => r,
        }
    }

    /// Whether some region covers `addr`, present or not.
    pub fn covers(&self, addr: usize) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }

    /// Memory the hypervisor must back: every region and page table arena.
    pub fn slots(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .regions
            .iter()
            .filter_map(|r| {
                Some(Slot {
                    va: Va::new(r.start)?,
                    gpa: r.gpa,
                    size: r.size,
                })
            })
            .collect();
        if let Some(pt) = &self.page_table {
            slots.extend(pt.allocator().arenas().map(|a| Slot {
                va: a.va,
                gpa: a.gpa,
                size: a.size,
            }));
        }
        slots
    }
}

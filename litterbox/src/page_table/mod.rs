//! Four-level x86_64 page tables for guest domains.
//!
//! Table nodes are host pages handed out by a [`PageTableAllocator`]; each
//! node also has a guest physical address so the guest MMU can walk the same
//! tree. The generic [`walk`](PageTable::walk) drives a [`PageVisitor`] over
//! every entry covering a range.
mod allocator;
mod walker;

pub use allocator::{ArenaSpan, NodeHandle, PageTableAllocator};
pub use walker::{PageTable, PageVisitor};

use abyss::addressing::Gpa;

/// Number of entries in a table node.
pub const ENTRIES: usize = 512;

bitflags::bitflags! {
    /// Flags of a page table entry. Interior and leaf entries share the
    /// layout; protection keys and PS only mean something at certain levels.
    pub struct PteFlags: u64 {
        /// Present.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the region referenced by this entry.
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed.
        const US = 1 << 2;
        /// Page-level write-through.
        const PWT = 1 << 3;
        /// Page-level cache disable.
        const PCD = 1 << 4;
        /// Accessed.
        const A = 1 << 5;
        /// Dirty.
        const D = 1 << 6;
        /// Page size; maps a 2-MByte or 1-GByte page instead of referencing a table.
        const PS = 1 << 7;
        /// Global.
        const G = 1 << 8;
        /// Protection key bit 0.
        const PK_0 = 1 << 59;
        /// Protection key bit 1.
        const PK_1 = 1 << 60;
        /// Protection key bit 2.
        const PK_2 = 1 << 61;
        /// Protection key bit 3.
        const PK_3 = 1 << 62;
        /// Execute-disable.
        const XD = 1 << 63;
    }
}

impl PteFlags {
    /// Flags of every interior entry.
    pub const DEFAULT_INTERIOR: Self = Self::from_bits_truncate(
        Self::P.bits | Self::RW.bits | Self::US.bits,
    );
}

/// A page table entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// Entry pointing at `gpa` with `flags`.
    #[inline]
    pub const fn new(gpa: Gpa, flags: PteFlags) -> Self {
        Self((gpa.into_usize() as u64 & Self::ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() != 0
    }

    /// Guest physical address this entry refers to, if present.
    #[inline]
    pub fn gpa(&self) -> Option<Gpa> {
        if self.is_present() {
            Gpa::new((self.0 & Self::ADDR_MASK) as usize)
        } else {
            None
        }
    }

    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Replace the flags, keeping the address.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) -> &mut Self {
        self.0 = (self.0 & Self::ADDR_MASK) | flags.bits();
        self
    }

    /// Clear the entry.
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte(0x{:x}, {:?})", self.0 & Self::ADDR_MASK, self.flags())
    }
}

/// Paging level, counted from the leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    /// Page table; entries map 4-KByte pages.
    Pt = 0,
    /// Page directory.
    Pd = 1,
    /// Page directory pointer table.
    Pdpt = 2,
    /// Page map level 4; the root.
    Pml4 = 3,
}

impl Level {
    /// Every level from the root down.
    pub const TOP_DOWN: [Level; 4] = [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt];

    /// Address bit at which this level's index starts.
    #[inline]
    pub const fn shift(self) -> usize {
        12 + 9 * self as usize
    }

    /// Bytes covered by one entry of this level.
    #[inline]
    pub const fn entry_span(self) -> usize {
        1 << self.shift()
    }

    /// Index of `va` in a node of this level.
    #[inline]
    pub const fn index(self, va: usize) -> usize {
        (va >> self.shift()) & (ENTRIES - 1)
    }

    /// Next level toward the leaves.
    #[inline]
    pub const fn child(self) -> Option<Level> {
        match self {
            Level::Pml4 => Some(Level::Pdpt),
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pt => None,
        }
    }
}

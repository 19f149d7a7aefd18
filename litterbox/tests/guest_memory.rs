//! Guest physical allocation and page table walks.
use abyss::addressing::Gpa;
use litterbox::{
    free_space::FreeSpaceAllocator,
    interval::VmArea,
    page_table::{Level, PageTable, PageTableEntry, PageVisitor},
};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};

const PAGE: usize = 0x1000;

proptest! {
    #[test]
    fn best_fit_never_overlaps(
        holes in prop::collection::vec((1..64usize, 1..8usize), 1..12),
        sizes in prop::collection::vec(1..6usize, 1..24),
    ) {
        let mut fsa = FreeSpaceAllocator::new(0x400_0000);
        for (page, len) in holes {
            fsa.reserve(page * PAGE, len * PAGE).unwrap();
        }

        let mut taken: Vec<VmArea> = Vec::new();
        for pages in sizes {
            let size = pages * PAGE;
            let smallest = fsa
                .free()
                .iter()
                .filter(|a| a.size >= size)
                .map(|a| a.size)
                .min();
            let before = fsa.free().clone();
            let gpa = fsa.malloc(size).unwrap().into_usize();

            // Carved out of one of the smallest blocks that fit.
            let block = before.find(gpa).copied().unwrap();
            prop_assert_eq!(Some(block.size), smallest);
            prop_assert_eq!(block.start, gpa);

            let got = VmArea::new(gpa, size, block.prot);
            prop_assert!(taken.iter().all(|t| !t.intersect(&got)));
            prop_assert!(fsa.used().covers(gpa, size));
            taken.push(got);
        }
        fsa.free().check_canonical().unwrap();
        fsa.used().check_canonical().unwrap();
    }
}

/// Identity maps leaves and counts visits per entry.
struct Counter {
    create: bool,
    levels: Vec<Level>,
    visits: HashMap<(Level, usize), usize>,
}

impl PageVisitor for Counter {
    fn create(&self) -> bool {
        self.create
    }

    fn applies(&self, level: Level) -> bool {
        self.levels.contains(&level)
    }

    fn leaf_frame(&mut self, va: usize) -> Option<Gpa> {
        Gpa::new(va)
    }

    fn visit(&mut self, _entry: &mut PageTableEntry, level: Level, va: usize) {
        *self.visits.entry((level, va >> level.shift())).or_default() += 1;
    }
}

/// Indices of the entries at `level` covering `[start, end)`.
fn covering(level: Level, start: usize, end: usize) -> BTreeSet<(Level, usize)> {
    (start >> level.shift()..=(end - 1) >> level.shift())
        .map(|idx| (level, idx))
        .collect()
}

proptest! {
    #[test]
    fn walk_visits_every_covering_entry_once(
        first in 0..0x2000usize,
        pages in 1..0x600usize,
        mask in 1..16u8,
    ) {
        // Up to 0x2000 pages from 32 MiB, crossing page directory boundaries.
        let start = 0x200_0000 + first * PAGE;
        let end = start + pages * PAGE;
        let levels: Vec<Level> = Level::TOP_DOWN
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, l)| *l)
            .collect();

        let mut fsa = FreeSpaceAllocator::new(1 << 39);
        let mut pt = PageTable::new(8, &mut fsa).unwrap();
        let mut counter = Counter {
            create: true,
            levels: levels.clone(),
            visits: HashMap::new(),
        };
        pt.walk(&mut fsa, start, end, &mut counter).unwrap();

        prop_assert!(counter.visits.values().all(|n| *n == 1));
        let expected: BTreeSet<_> = levels
            .iter()
            .flat_map(|l| covering(*l, start, end))
            .collect();
        let seen: BTreeSet<_> = counter.visits.keys().copied().collect();
        prop_assert_eq!(seen, expected);

        for va in [start, end - PAGE, (start + end) / 2 & !(PAGE - 1)] {
            prop_assert_eq!(pt.translate(va).and_then(|e| e.gpa()), Gpa::new(va));
        }
        prop_assert!(pt.translate(end).is_none());
        prop_assert!(pt.translate(start - PAGE).is_none());
    }
}

#[test]
fn read_only_walk_skips_holes() {
    let mut fsa = FreeSpaceAllocator::new(1 << 39);
    let mut pt = PageTable::new(4, &mut fsa).unwrap();
    let mut fill = Counter {
        create: true,
        levels: Vec::new(),
        visits: HashMap::new(),
    };
    pt.walk(&mut fsa, 0x60_0000, 0x60_4000, &mut fill).unwrap();
    let nodes = pt.allocator().nodes();

    let mut look = Counter {
        create: false,
        levels: vec![Level::Pt],
        visits: HashMap::new(),
    };
    pt.walk(&mut fsa, 0x5f_0000, 0x61_0000, &mut look).unwrap();
    assert_eq!(look.visits.len(), 4);
    assert_eq!(pt.allocator().nodes(), nodes);
}

//! Interval lists against a page-granular model.
use litterbox::{
    interval::{IntervalList, VmArea},
    prot::Prot,
    Error,
};
use proptest::prelude::*;

const PAGE: usize = 0x1000;
const BASE: usize = 0x10_0000;
const PAGES: usize = 64;

#[derive(Clone, Debug)]
enum Op {
    Insert { page: usize, len: usize, prot: Prot },
    Remove { page: usize, len: usize },
}

fn area(page: usize, len: usize, prot: Prot) -> VmArea {
    VmArea::new(BASE + page * PAGE, len * PAGE, prot)
}

fn arb_prot() -> impl Strategy<Value = Prot> {
    prop_oneof![Just(Prot::R), Just(Prot::RW), Just(Prot::RX)]
}

fn arb_op() -> impl Strategy<Value = Op> {
    (0..PAGES)
        .prop_flat_map(|page| (Just(page), 1..=PAGES - page))
        .prop_flat_map(|(page, len)| {
            prop_oneof![
                3 => arb_prot().prop_map(move |prot| Op::Insert { page, len, prot }),
                1 => Just(Op::Remove { page, len }),
            ]
        })
}

/// Protection of every page, as covered by `list`.
fn expand(list: &IntervalList) -> Vec<Option<Prot>> {
    let mut pages = vec![None; PAGES];
    for a in list {
        for page in (a.start - BASE) / PAGE..(a.end() - BASE) / PAGE {
            assert!(pages[page].is_none(), "page {} covered twice", page);
            pages[page] = Some(a.prot);
        }
    }
    pages
}

fn snapshot(list: &IntervalList) -> Vec<VmArea> {
    list.iter().copied().collect()
}

proptest! {
    #[test]
    fn list_follows_page_model(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut list = IntervalList::new();
        let mut model: Vec<Option<Prot>> = vec![None; PAGES];

        for op in ops {
            match op {
                Op::Insert { page, len, prot } => {
                    let conflict = model[page..page + len]
                        .iter()
                        .any(|p| matches!(p, Some(q) if *q != prot));
                    let before = snapshot(&list);
                    match list.insert(area(page, len, prot)) {
                        Ok(()) => {
                            prop_assert!(!conflict);
                            model[page..page + len].iter_mut().for_each(|p| *p = Some(prot));
                        }
                        Err(Error::InconsistentOverlap { .. }) => {
                            prop_assert!(conflict);
                            prop_assert_eq!(snapshot(&list), before);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                }
                Op::Remove { page, len } => {
                    list.remove(area(page, len, Prot::empty()));
                    model[page..page + len].iter_mut().for_each(|p| *p = None);
                }
            }
            prop_assert!(list.check_canonical().is_ok());
            prop_assert_eq!(expand(&list), model.clone());
        }
    }

    #[test]
    fn remove_then_insert_restores(
        spans in prop::collection::vec((0..PAGES, 1..8usize, arb_prot()), 1..12),
        pick in any::<prop::sample::Index>(),
        cut in (any::<prop::sample::Index>(), any::<prop::sample::Index>()),
    ) {
        let mut list = IntervalList::new();
        for (page, len, prot) in spans {
            // Conflicting spans are rejected and leave the list alone.
            let _ = list.insert(area(page, len.min(PAGES - page), prot));
        }
        let before = snapshot(&list);

        // A sub-range of one area, so it is covered with a single protection.
        let target = before[pick.index(before.len())];
        let pages = target.size / PAGE;
        let first = cut.0.index(pages);
        let len = 1 + cut.1.index(pages - first);
        let range = VmArea::new(target.start + first * PAGE, len * PAGE, target.prot);

        list.remove(range);
        prop_assert!(!list.covers(range.start, range.size));
        prop_assert!(list.check_canonical().is_ok());
        list.insert(range).unwrap();
        prop_assert_eq!(snapshot(&list), before);
    }

    #[test]
    fn spanning_insert_conflicts_with_any_neighbour(
        left in arb_prot(),
        right in arb_prot(),
        new in arb_prot(),
    ) {
        let mut list = IntervalList::new();
        list.insert(area(0, 2, left)).unwrap();
        list.insert(area(4, 2, right)).unwrap();
        let before = snapshot(&list);

        let result = list.insert(area(1, 4, new));
        if new == left && new == right {
            prop_assert!(result.is_ok());
            prop_assert_eq!(snapshot(&list), vec![area(0, 6, new)]);
        } else {
            let culprit = if new != left { area(0, 2, left) } else { area(4, 2, right) };
            match result {
                Err(Error::InconsistentOverlap { a_start, a_end, a_prot, b_prot, .. }) => {
                    prop_assert_eq!((a_start, a_end, a_prot), (culprit.start, culprit.end(), culprit.prot));
                    prop_assert_eq!(b_prot, new);
                }
                other => prop_assert!(false, "expected a conflict, got {:?}", other),
            }
            prop_assert_eq!(snapshot(&list), before);
        }
    }

    #[test]
    fn inserting_then_removing_everything_empties(
        spans in prop::collection::vec((0..PAGES, 1..8usize, arb_prot()), 1..10),
    ) {
        let mut list = IntervalList::new();
        let mut inserted = Vec::new();
        for (page, len, prot) in spans {
            let a = area(page, len.min(PAGES - page), prot);
            if list.insert(a).is_ok() {
                inserted.push(a);
            }
        }
        for a in inserted {
            list.remove(a);
        }
        prop_assert!(list.is_empty());
        prop_assert_eq!(list.total(), 0);
    }
}

#[test]
fn overlapping_same_protection_merges() {
    let mut list = IntervalList::new();
    list.insert(VmArea::new(0x1000, 0x2000, Prot::RW)).unwrap();
    list.insert(VmArea::new(0x2000, 0x2000, Prot::RW)).unwrap();
    assert_eq!(snapshot(&list), vec![VmArea::new(0x1000, 0x3000, Prot::RW)]);
}

#[test]
fn touching_different_protection_stays_apart() {
    let mut list = IntervalList::new();
    list.insert(VmArea::new(0x1000, 0x1000, Prot::RW)).unwrap();
    list.insert(VmArea::new(0x2000, 0x1000, Prot::R)).unwrap();
    assert_eq!(list.len(), 2);
    list.check_canonical().unwrap();
    assert_eq!(list.find(0x2800).map(|a| a.prot), Some(Prot::R));
}

#[test]
fn overlapping_different_protection_is_rejected() {
    let mut list = IntervalList::new();
    list.insert(VmArea::new(0x1000, 0x2000, Prot::RW)).unwrap();
    let err = list
        .insert(VmArea::new(0x2000, 0x2000, Prot::R))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InconsistentOverlap {
            a_start: 0x1000,
            a_end: 0x3000,
            ..
        }
    ));
    assert_eq!(snapshot(&list), vec![VmArea::new(0x1000, 0x2000, Prot::RW)]);
}

#[test]
fn conflict_with_a_later_neighbour_leaves_list_untouched() {
    let mut list = IntervalList::new();
    list.insert(VmArea::new(0x1000, 0x1000, Prot::RW)).unwrap();
    list.insert(VmArea::new(0x3000, 0x1000, Prot::R)).unwrap();
    let before = snapshot(&list);

    // Merges with the first node, then runs into the second.
    let err = list
        .insert(VmArea::new(0x1000, 0x3000, Prot::RW))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InconsistentOverlap {
            a_start: 0x3000,
            a_prot,
            b_start: 0x1000,
            b_end: 0x4000,
            ..
        } if a_prot == Prot::R
    ));
    assert_eq!(snapshot(&list), before);
    list.check_canonical().unwrap();
}

#[test]
fn removing_the_middle_splits() {
    let mut list = IntervalList::new();
    list.insert(VmArea::new(0x1000, 0x4000, Prot::RX)).unwrap();
    list.remove(VmArea::new(0x2000, 0x1000, Prot::empty()));
    assert_eq!(
        snapshot(&list),
        vec![
            VmArea::new(0x1000, 0x1000, Prot::RX),
            VmArea::new(0x3000, 0x2000, Prot::RX),
        ]
    );
}

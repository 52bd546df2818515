use std::collections::HashSet;

use crate::alloc::{MemHandle, PageAllocator, XMS_START};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Alloc { pages: usize, sequence: bool },
    Free(usize),
    Resize { idx: usize, pages: usize, sequence: bool },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..24, any::<bool>()).prop_map(|(pages, sequence)| Op::Alloc { pages, sequence }),
        (0usize..16).prop_map(Op::Free),
        (0usize..16, 0usize..24, any::<bool>())
            .prop_map(|(idx, pages, sequence)| Op::Resize { idx, pages, sequence }),
    ]
}

fn owned_pages(alloc: &PageAllocator, handles: &[Option<MemHandle>]) -> Vec<u32> {
    handles
        .iter()
        .flatten()
        .flat_map(|&h| alloc.chain(h).collect::<Vec<_>>())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn no_page_is_owned_twice_and_free_count_is_conserved(
        ops in prop::collection::vec(arb_op(), 1..48),
    ) {
        let total = 0x200usize;
        let mut alloc = PageAllocator::new(total);
        let mut handles: Vec<Option<MemHandle>> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc { pages, sequence } => {
                    if let Some(h) = alloc.allocate_pages(pages, sequence) {
                        prop_assert_eq!(alloc.allocated_pages(h), pages);
                        handles.push(Some(h));
                    }
                }
                Op::Free(idx) => {
                    if let Some(slot) = handles.get_mut(idx) {
                        if let Some(h) = slot.take() {
                            alloc.release_pages(h);
                        }
                    }
                }
                Op::Resize { idx, pages, sequence } => {
                    if let Some(slot) = handles.get_mut(idx) {
                        let before = *slot;
                        if alloc.reallocate_pages(slot, pages, sequence).is_some() {
                            if let Some(h) = *slot {
                                prop_assert_eq!(alloc.allocated_pages(h), pages);
                            }
                        } else {
                            prop_assert_eq!(*slot, before);
                        }
                    }
                }
            }

            let owned = owned_pages(&alloc, &handles);
            let unique: HashSet<u32> = owned.iter().copied().collect();
            prop_assert_eq!(unique.len(), owned.len(), "a page belongs to two chains");
            prop_assert!(owned.iter().all(|&p| p as usize >= XMS_START));
            prop_assert_eq!(alloc.free_total() + owned.len(), total - XMS_START);
        }
    }
}

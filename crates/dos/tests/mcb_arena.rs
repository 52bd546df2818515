use dos::callback::CallbackTable;
use dos::dos_memory::{DosArena, Mcb, DOS_MEM_START};
use memory::PcMemory;
use proptest::prelude::*;

fn arena() -> (PcMemory, DosArena) {
    let mut mem = PcMemory::new(2 * 1024 * 1024).unwrap();
    let mut callbacks = CallbackTable::new(&mut mem).unwrap();
    let dos = DosArena::setup(&mut mem, &mut callbacks).unwrap();
    (mem, dos)
}

/// Sum of all block sizes plus their MCBs, walking the whole low chain.
fn chain_span(mem: &mut PcMemory) -> u32 {
    let mut mcb = Mcb(DOS_MEM_START);
    let mut span = 0u32;
    loop {
        span += u32::from(mcb.size(mem)) + 1;
        if mcb.kind(mem) == b'Z' {
            return span;
        }
        mcb = mcb.next(mem);
    }
}

#[derive(Clone, Debug)]
enum Op {
    Allocate(u16),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u16..0x800).prop_map(Op::Allocate),
        any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn compress_is_idempotent(ops in proptest::collection::vec(op(), 1..40)) {
        let (mut mem, mut dos) = arena();
        let span = chain_span(&mut mem);
        let mut live: Vec<u16> = Vec::new();
        for op in ops {
            match op {
                Op::Allocate(paras) => {
                    if let Ok(seg) = dos.allocate(&mut mem, paras).unwrap() {
                        live.push(seg);
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let seg = live.swap_remove(i % live.len());
                    prop_assert!(dos.free(&mut mem, seg).is_ok());
                }
                Op::Free(_) => {}
            }
        }

        dos.compress(&mut mem, None).unwrap();
        prop_assert_eq!(dos.compress(&mut mem, None).unwrap(), 0);
        prop_assert_eq!(chain_span(&mut mem), span);
    }

    #[test]
    fn freeing_everything_leaves_one_mergeable_run(sizes in proptest::collection::vec(1u16..0x400, 1..20)) {
        let (mut mem, mut dos) = arena();
        let mut live = Vec::new();
        for paras in sizes {
            if let Ok(seg) = dos.allocate(&mut mem, paras).unwrap() {
                live.push(seg);
            }
        }
        for seg in live {
            prop_assert!(dos.free(&mut mem, seg).is_ok());
        }
        dos.compress(&mut mem, None).unwrap();
        prop_assert_eq!(dos.compress(&mut mem, None).unwrap(), 0);

        // After merging, no two free blocks are adjacent.
        let mut mcb = Mcb(DOS_MEM_START);
        let mut previous_free = false;
        loop {
            let free = mcb.owner(&mut mem) == 0;
            prop_assert!(!(free && previous_free));
            previous_free = free;
            if mcb.kind(&mut mem) == b'Z' {
                break;
            }
            mcb = mcb.next(&mut mem);
        }
    }
}

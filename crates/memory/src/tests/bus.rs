use crate::{MemoryBus, PcMemory, RealPtr};

fn new_mem() -> PcMemory {
    PcMemory::new(2 * 1024 * 1024).unwrap()
}

#[test]
fn unmapped_reads_return_all_ones() {
    let mut mem = new_mem();

    assert_eq!(mem.read_u8(0x40_0000), 0xFF);
    assert_eq!(mem.read_u16(0x40_0000), 0xFFFF);
    assert_eq!(mem.read_u32(0x40_0000), 0xFFFF_FFFF);
}

#[test]
fn boundary_crossing_reads_and_writes_are_le_correct() {
    let mut mem = new_mem();
    let top = 2 * 1024 * 1024 - 1;
    mem.write_u8(top - 1, 0x11);
    mem.write_u8(top, 0x22);

    assert_eq!(mem.read_u16(top - 1), 0x2211);
    assert_eq!(mem.read_u16(top), 0xFF22);

    mem.write_u16(top, 0xBBAA);
    assert_eq!(mem.read_u8(top), 0xAA);
    assert_eq!(mem.read_u8(top + 1), 0xFF);
}

#[test]
fn hma_aliases_low_memory_until_a20_is_enabled() {
    let mut mem = new_mem();
    // FFFF:0010 -> 0x100000, which wraps to 0 with the gate closed.
    mem.real_write_u16(0x0000, 0x0000, 0x1234);
    assert_eq!(mem.real_read_u16(0xFFFF, 0x0010), 0x1234);

    mem.set_a20(true);
    mem.real_write_u16(0xFFFF, 0x0010, 0xABCD);
    assert_eq!(mem.real_read_u16(0x0000, 0x0000), 0x1234);
    assert_eq!(mem.read_u16(RealPtr::new(0xFFFF, 0x10).linear().raw()), 0xABCD);
}

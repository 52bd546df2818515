//! Virtual Control Program Interface.
//!
//! The private area lives at the start of the EMS system handle and holds the monitor's own
//! protected-mode environment:
//!
//! | offset | contents |
//! |--------|----------|
//! | 0000   | GDT: null, LDT (08), TSS (10) |
//! | 1000   | LDT: null, code (0C), data (14), both based at the private area |
//! | 2000   | IDT, 256 interrupt gates into the stubs below |
//! | 2800   | one `call 2E00; iret` stub per vector |
//! | 2E00   | trap into the V86 monitor followed by `iretd` |
//! | 3000   | TSS with ring-0 stack 14:2000 and its I/O permission bitmap |

use std::collections::BTreeSet;

use memory::{MemHandle, MemoryBus, PcMemory};
use tracing::{debug, warn};

use super::{Ems, EmmResult, EMM_MAX_PHYS, EMM_PAGEFRAME, EMM_SYSTEM_HANDLE};
use crate::callback::{CallbackReturn, CallbackTable, Handler, HandlerObject, StubKind, CB_BASE, CB_SIZE};
use crate::cpu::{Cr0, CpuState, DescriptorTable, EFlags, SegReg};
use crate::error::{EmmError, FatalError, Result};
use crate::machine::Machine;

pub const GDT_OFFSET: u32 = 0x0000;
pub const LDT_OFFSET: u32 = 0x1000;
pub const IDT_OFFSET: u32 = 0x2000;
pub const GATE_STUBS_OFFSET: u32 = 0x2800;
pub const MONITOR_TRAP_OFFSET: u32 = 0x2E00;
pub const TSS_OFFSET: u32 = 0x3000;
/// I/O permission bitmap, relative to the TSS.
pub const TSS_IOMAP: u32 = 0x68;
/// The bitmap covers ports 0..0x1000.
pub const TSS_IOMAP_BYTES: u32 = 0x200;

pub const GDT_LIMIT: u16 = 0xFF;
pub const IDT_LIMIT: u16 = 0x7FF;
pub const LDT_SELECTOR: u16 = 0x08;
pub const TSS_SELECTOR: u16 = 0x10;
/// Ring-0 stack: LDT data descriptor.
pub const RING0_SS: u16 = 0x14;
pub const RING0_ESP: u32 = 0x2000;

/// Flags pushed for a V86 task: VM, IOPL 3.
pub const V86_FLAGS: u32 = 0x0002_3002;

const PIC1_DEFAULT: u8 = 0x08;
const PIC2_DEFAULT: u8 = 0x70;

/// Bytes of one page-table entry template handed out by DE01.
const PTE_ACCESS: u8 = 0x67;

#[derive(Debug)]
pub struct Vcpi {
    private_area: u32,
    pub(crate) pic1: u8,
    pub(crate) pic2: u8,
    /// Page numbers handed out by DE04 and not yet returned.
    pub(crate) raw_pages: BTreeSet<u32>,
    pm: HandlerObject,
    monitor: HandlerObject,
}

impl Vcpi {
    /// Builds the private area in the memory of the EMS system handle and registers the
    /// protected-mode entry point and the V86 monitor.
    pub(crate) fn install(
        callbacks: &mut CallbackTable,
        mem: &mut PcMemory,
        ems: &Ems,
        virtual_a20: bool,
    ) -> Result<Self> {
        let private_area = ems
            .handle(EMM_SYSTEM_HANDLE)
            .and_then(|h| h.memory())
            .map(|h| h.base())
            .ok_or(FatalError::PrivateAreaExhausted)?;

        let pm = HandlerObject::install(callbacks, mem, Handler::VcpiPm, StubKind::Iretd, "VCPI PM")?;
        setup_private_area(mem, private_area, virtual_a20);
        let monitor = HandlerObject::install(callbacks, mem, Handler::V86Monitor, StubKind::Iret, "V86 Monitor")?;

        let [lo, hi] = monitor.id().to_le_bytes();
        mem.write_bytes(
            private_area + MONITOR_TRAP_OFFSET,
            &[0xFE, 0x38, lo, hi, 0x66, 0xCF],
        );
        debug!(private_area, "VCPI private area ready");
        Ok(Self {
            private_area,
            pic1: PIC1_DEFAULT,
            pic2: PIC2_DEFAULT,
            raw_pages: BTreeSet::new(),
            pm,
            monitor,
        })
    }

    pub fn private_area(&self) -> u32 {
        self.private_area
    }

    pub fn pic_mappings(&self) -> (u8, u8) {
        (self.pic1, self.pic2)
    }

    /// Offset of the protected-mode entry point within the callback code segment.
    pub fn pm_interface(&self) -> u32 {
        u32::from(self.pm.id()) * u32::from(CB_SIZE)
    }

    pub fn monitor_id(&self) -> u16 {
        self.monitor.id()
    }

    pub fn raw_pages(&self) -> impl Iterator<Item = u32> + '_ {
        self.raw_pages.iter().copied()
    }

    /// DE04: one 4 KiB page straight from the allocator; EDX receives its physical address.
    fn allocate_raw_page(&mut self, cpu: &mut CpuState, mem: &mut PcMemory) {
        match mem.pages_mut().allocate_pages(1, false) {
            Some(page) => {
                self.raw_pages.insert(page.page());
                cpu.edx = page.base();
                cpu.set_ah(0);
            }
            None => cpu.set_ah(EmmError::OutOfLogicalPages.code()),
        }
    }

    /// DE05: returns a page obtained through DE04.
    fn free_raw_page(&mut self, cpu: &mut CpuState, mem: &mut PcMemory) {
        let page = cpu.edx >> 12;
        if !self.raw_pages.remove(&page) {
            warn!(address = cpu.edx, "VCPI: freeing a page that was not allocated by VCPI");
            cpu.set_ah(EmmError::InvalidHandle.code());
            return;
        }
        if let Some(handle) = MemHandle::from_page(page) {
            mem.pages_mut().release_pages(handle);
        }
        cpu.set_ah(0);
    }

    pub(crate) fn uninstall(self, callbacks: &mut CallbackTable, mem: &mut PcMemory) -> Result<()> {
        for page in self.raw_pages.iter().filter_map(|&p| MemHandle::from_page(p)) {
            mem.pages_mut().release_pages(page);
        }
        self.pm.uninstall(callbacks, mem)?;
        self.monitor.uninstall(callbacks, mem)
    }
}

fn descriptor_words(base: u32, limit: u16, access: u32) -> (u32, u32) {
    (
        ((base & 0xFFFF) << 16) | u32::from(limit),
        ((base & 0x00FF_0000) >> 16) | (base & 0xFF00_0000) | access,
    )
}

/// Writes the descriptor tables, gate stubs and TSS of the private area at `pa`.
pub fn setup_private_area<B: MemoryBus + ?Sized>(mem: &mut B, pa: u32, virtual_a20: bool) {
    let write_desc = |mem: &mut B, at: u32, (lo, hi): (u32, u32)| {
        mem.write_u32(at, lo);
        mem.write_u32(at + 4, hi);
    };

    let ldt = pa + LDT_OFFSET;
    let tss = pa + TSS_OFFSET;
    write_desc(mem, pa + GDT_OFFSET, (0, 0));
    write_desc(mem, pa + GDT_OFFSET + 0x08, descriptor_words(ldt, 0xFF, 0x8200));
    write_desc(
        mem,
        pa + GDT_OFFSET + 0x10,
        descriptor_words(tss, (TSS_IOMAP + TSS_IOMAP_BYTES) as u16, 0x8900),
    );

    write_desc(mem, ldt, (0, 0));
    write_desc(mem, ldt + 0x08, descriptor_words(pa, 0xFFFF, 0x9A00));
    write_desc(mem, ldt + 0x10, descriptor_words(pa, 0xFFFF, 0x9200));

    for vector in 0..0x100u32 {
        let stub = pa + GATE_STUBS_OFFSET + vector * 4;
        let rel = (MONITOR_TRAP_OFFSET - (GATE_STUBS_OFFSET + vector * 4 + 3)) as u16;
        let [lo, hi] = rel.to_le_bytes();
        mem.write_bytes(stub, &[0xE8, lo, hi, 0xCF]);

        let gate = pa + IDT_OFFSET + vector * 8;
        mem.write_u32(gate, 0x000C_0000 | (GATE_STUBS_OFFSET + vector * 4));
        mem.write_u32(gate + 4, 0x0000_EE00);
    }

    mem.write_bytes(tss, &[0u8; (TSS_IOMAP + TSS_IOMAP_BYTES) as usize]);
    mem.write_u32(tss + 4, RING0_ESP);
    mem.write_u32(tss + 8, u32::from(RING0_SS));
    mem.write_u32(tss + 0x66, TSS_IOMAP);
    if virtual_a20 {
        let byte = tss + TSS_IOMAP + 0x92 / 8;
        let val = mem.read_u8(byte);
        mem.write_u8(byte, val | 1 << (0x92 % 8));
    }
}

/// Loads the private area's descriptor tables, as both the PM-to-V86 switch and V86 startup do.
fn load_private_tables(cpu: &mut CpuState, mem: &mut PcMemory, pa: u32) {
    let busy = pa + GDT_OFFSET + u32::from(TSS_SELECTOR & 0xFFF8) + 5;
    let val = mem.read_u8(busy);
    mem.write_u8(busy, val & 0xFD);
    cpu.gdtr = DescriptorTable {
        base: pa + GDT_OFFSET,
        limit: GDT_LIMIT,
    };
    cpu.idtr = DescriptorTable {
        base: pa + IDT_OFFSET,
        limit: IDT_LIMIT,
    };
    cpu.lldt(mem, LDT_SELECTOR);
    cpu.ltr(mem, TSS_SELECTOR);
}

fn stack_addr(cpu: &CpuState, delta: u32) -> u32 {
    cpu.ss.base.wrapping_add(cpu.esp.wrapping_add(delta) & cpu.stack_mask())
}

/// Physical address of the 4 KiB page at `CX << 12`, following the frame mapping.
fn physical_address_of(ems: &Ems, mem: &PcMemory, cx: u16) -> EmmResult<u32> {
    let mem_seg = u32::from(cx) << 8;
    let frame = u32::from(EMM_PAGEFRAME);
    if !(frame..frame + 0x1000).contains(&mem_seg) {
        return Ok(u32::from(cx) << 12);
    }
    let phys = (((mem_seg - frame) / 0x400) as usize).min(EMM_MAX_PHYS - 1);
    let mapping = ems.mappings[phys];
    if !mapping.is_mapped() {
        return Err(EmmError::IllegalPhysicalPage);
    }
    let chain = ems
        .handle(mapping.handle)
        .and_then(|h| h.memory())
        .ok_or(EmmError::IllegalPhysicalPage)?;
    let index = usize::from(mapping.page) * 4 + usize::from(cx & 3);
    let page = mem
        .pages()
        .next_handle_at(chain, index)
        .ok_or(EmmError::IllegalPhysicalPage)?;
    Ok(page.base())
}

/// DE01: fills the client's first-megabyte page table at ES:DI and its three descriptors at
/// DS:SI.
fn protected_mode_interface(ems: &Ems, vcpi: &Vcpi, cpu: &mut CpuState, mem: &mut PcMemory) {
    let table = cpu.linear(SegReg::Es, u32::from(cpu.di()));
    for ct in 0..0x100u32 {
        let frame = if ct < 0xFF { ct * 0x10 } else { 0x1100 };
        let entry = table + ct * 4;
        mem.write_u8(entry, PTE_ACCESS);
        mem.write_u16(entry + 1, frame as u16);
        mem.write_u8(entry + 3, 0);
    }
    for (ct, mapping) in ems.mappings.iter().enumerate() {
        let Some(chain) = ems.handle(mapping.handle).and_then(|h| h.memory()) else {
            continue;
        };
        let entries = table + (u32::from(EMM_PAGEFRAME) >> 6) + ct as u32 * 0x10;
        let first = usize::from(mapping.page) * 4;
        for (k, page) in mem.pages().chain(chain).skip(first).take(4).collect::<Vec<_>>().into_iter().enumerate() {
            mem.write_u16(entries + k as u32 * 4 + 1, (page * 0x10) as u16);
        }
    }
    cpu.set_di(cpu.di().wrapping_add(0x400));

    let desc = cpu.linear(SegReg::Ds, u32::from(cpu.si()));
    mem.write_u32(desc, 0x0000_FFFF | (CB_BASE & 0xFFFF) << 16);
    mem.write_u32(desc + 4, 0x0000_9A00 | (CB_BASE & 0x1F_0000) >> 16);
    for n in [1u32, 2] {
        mem.write_u32(desc + n * 8, 0x0000_FFFF);
        mem.write_u32(desc + n * 8 + 4, 0x0000_9200);
    }
    cpu.ebx = vcpi.pm_interface() & 0xFFFF;
    cpu.set_ah(0);
}

/// DE0C from V86 mode: enter the client's protected-mode environment described at linear
/// address ESI.
fn switch_to_protected_mode(cpu: &mut CpuState, mem: &mut PcMemory) {
    cpu.set_flag(EFlags::IF, false);
    cpu.cpl = 0;

    let esi = cpu.esi;
    let cr3 = mem.read_u32(esi);
    let gdt_addr = mem.read_u32(esi + 4);
    let idt_addr = mem.read_u32(esi + 8);
    let ldt = mem.read_u16(esi + 0x0C);
    let tr = mem.read_u16(esi + 0x0E);
    let eip = mem.read_u32(esi + 0x10);
    let cs = mem.read_u16(esi + 0x14);

    let gdt = DescriptorTable {
        limit: mem.read_u16(gdt_addr),
        base: mem.read_u32(gdt_addr + 2),
    };
    let idt = DescriptorTable {
        limit: mem.read_u16(idt_addr),
        base: mem.read_u32(idt_addr + 2),
    };

    cpu.eflags.remove(EFlags::VM | EFlags::NT);
    cpu.eflags.insert(EFlags::IOPL);
    cpu.cr0.insert(Cr0::PE);
    if cr3 != 0 {
        cpu.cr0.insert(Cr0::PG);
    }
    cpu.cr3 = cr3;

    let busy = gdt.base.wrapping_add(u32::from(tr & 0xFFF8)) + 5;
    let val = mem.read_u8(busy);
    mem.write_u8(busy, val & 0xFD);

    cpu.gdtr = gdt;
    cpu.idtr = idt;
    cpu.lldt(mem, ldt);
    if cpu.ldtr.base == 0 && ldt & !3 != 0 {
        warn!(ldt, "VCPI: could not load LDT");
    }
    cpu.ltr(mem, tr);
    for reg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
        cpu.load_segment(mem, reg, 0);
    }
    debug!(cs, eip, cr3, "VCPI: switch to protected mode");
    cpu.far_jump(mem, cs, eip);
}

/// INT 67h AH=DEh issued from real or V86 mode.
pub(crate) fn vcpi_call(ems: &mut Ems, cpu: &mut CpuState, mem: &mut PcMemory) {
    let Some(vcpi) = ems.vcpi.as_ref() else {
        warn!("EMS: VCPI call {:#04x} not supported", cpu.al());
        cpu.set_ah(EmmError::FunctionNotSupported.code());
        return;
    };
    match cpu.al() {
        0x00 => {
            if (cpu.cx() == 0 && cpu.di() == 0x0012) || cpu.v86_mode() {
                cpu.set_ah(0);
                cpu.set_bx(0x100);
            } else {
                cpu.set_ah(EmmError::FunctionNotSupported.code());
            }
        }
        0x01 => protected_mode_interface(ems, vcpi, cpu, mem),
        0x02 => {
            let bytes = mem.pages().total_pages() as u32 * memory::PAGE_SIZE;
            cpu.edx = bytes.wrapping_sub(1) & 0xFFFF_F000;
            cpu.set_ah(0);
        }
        0x03 => {
            cpu.edx = mem.pages().free_total() as u32;
            cpu.set_ah(0);
        }
        0x04 | 0x05 => {
            if let Some(vcpi) = ems.vcpi.as_mut() {
                if cpu.al() == 0x04 {
                    vcpi.allocate_raw_page(cpu, mem);
                } else {
                    vcpi.free_raw_page(cpu, mem);
                }
            }
        }
        0x06 => match physical_address_of(ems, mem, cpu.cx()) {
            Ok(addr) => {
                cpu.edx = addr;
                cpu.set_ah(0);
            }
            Err(e) => cpu.set_ah(e.code()),
        },
        0x0A => {
            let (pic1, pic2) = vcpi.pic_mappings();
            cpu.set_bx(u16::from(pic1));
            cpu.set_cx(u16::from(pic2));
            cpu.set_ah(0);
        }
        0x0B => {
            cpu.set_flag(EFlags::IF, false);
            let (pic1, pic2) = (cpu.bl(), cpu.cl());
            if let Some(vcpi) = ems.vcpi.as_mut() {
                vcpi.pic1 = pic1;
                vcpi.pic2 = pic2;
            }
            cpu.set_ah(0);
        }
        0x0C => switch_to_protected_mode(cpu, mem),
        al => {
            warn!("EMS: VCPI call {al:#04x} not supported");
            cpu.set_ah(EmmError::FunctionNotSupported.code());
        }
    }
}

impl Machine {
    /// Entry point reached by far calls from VCPI clients running in protected mode.
    pub(crate) fn vcpi_pm(&mut self) -> Result<CallbackReturn> {
        let Some(pa) = self.ems.as_ref().and_then(|e| e.vcpi()).map(Vcpi::private_area) else {
            warn!("VCPI protected-mode entry called without VCPI");
            return Ok(CallbackReturn::Next);
        };
        let (cpu, mem) = (&mut self.cpu, &mut self.mem);
        let vcpi = self.ems.as_mut().and_then(|e| e.vcpi.as_mut());
        match cpu.ax() {
            0xDE03 => {
                cpu.edx = mem.pages().free_total() as u32;
                cpu.set_ah(0);
            }
            0xDE04 => {
                if let Some(vcpi) = vcpi {
                    vcpi.allocate_raw_page(cpu, mem);
                }
            }
            0xDE05 => {
                if let Some(vcpi) = vcpi {
                    vcpi.free_raw_page(cpu, mem);
                }
            }
            0xDE0C => {
                cpu.set_flag(EFlags::IF, false);
                let flags = stack_addr(cpu, 0x10);
                mem.write_u32(flags, V86_FLAGS);
                cpu.cr0 = Cr0::from_bits_retain(cpu.cr0.bits() & 0x7FFF_FFF7);
                cpu.cr3 = 0;
                load_private_tables(cpu, mem, pa);
                cpu.eflags.remove(EFlags::NT);
                cpu.esp = cpu.esp.wrapping_add(8);
                cpu.cpl = 0;
                debug!("VCPI: switch to V86 mode");
                cpu.iret(mem, true);
            }
            ax => warn!("Unhandled VCPI function {ax:#06x} in protected mode"),
        }
        Ok(CallbackReturn::Next)
    }

    /// Moves the CPU from real mode into a V86 task running the current code, using the VCPI
    /// private area as the monitor's environment.
    pub(crate) fn enter_v86(&mut self) -> Result<()> {
        let pa = self
            .ems
            .as_ref()
            .and_then(|e| e.vcpi())
            .map(Vcpi::private_area)
            .ok_or(FatalError::PrivateAreaExhausted)?;
        let (cpu, mem) = (&mut self.cpu, &mut self.mem);
        cpu.cr0 = Cr0::PE;
        load_private_tables(cpu, mem, pa);

        let esp = cpu.esp;
        let frame = [
            u32::from(cpu.gs.selector),
            u32::from(cpu.fs.selector),
            u32::from(cpu.ds.selector),
            u32::from(cpu.es.selector),
            u32::from(cpu.ss.selector),
            esp,
            V86_FLAGS,
            u32::from(cpu.cs.selector),
            cpu.eip & 0xFFFF,
        ];
        for val in frame {
            cpu.push32(mem, val);
        }
        cpu.cpl = 0;
        cpu.iret(mem, true);
        debug!(cs = cpu.cs.selector, ip = cpu.eip, "entered V86 mode");
        Ok(())
    }

    /// Drops from V86 mode back to plain real mode.
    pub(crate) fn leave_v86(&mut self) {
        let cpu = &mut self.cpu;
        cpu.cr0 = Cr0::empty();
        cpu.cr3 = 0;
        cpu.eflags.remove(EFlags::IOPL | EFlags::VM);
        cpu.idtr = DescriptorTable {
            base: 0,
            limit: 0x3FF,
        };
        cpu.cpl = 0;
        debug!("left V86 mode");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Descriptor;

    struct Flat(Vec<u8>);

    impl MemoryBus for Flat {
        fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) {
            let a = addr as usize;
            buf.copy_from_slice(&self.0[a..a + buf.len()]);
        }

        fn write_bytes(&mut self, addr: u32, buf: &[u8]) {
            let a = addr as usize;
            self.0[a..a + buf.len()].copy_from_slice(buf);
        }
    }

    const PA: u32 = 0x20_0000;

    fn area(virtual_a20: bool) -> Flat {
        let mut mem = Flat(vec![0xAA; 0x20_4000]);
        setup_private_area(&mut mem, PA, virtual_a20);
        mem
    }

    #[test]
    fn descriptor_tables_point_into_the_private_area() {
        let mut mem = area(false);
        let ldt = Descriptor::new(mem.read_u32(PA + 8), mem.read_u32(PA + 12));
        assert_eq!(ldt.base(), PA + LDT_OFFSET);
        assert_eq!(ldt.limit(), 0xFF);
        let tss = Descriptor::new(mem.read_u32(PA + 0x10), mem.read_u32(PA + 0x14));
        assert_eq!(tss.base(), PA + TSS_OFFSET);
        assert_eq!(tss.limit(), 0x268);

        let code = Descriptor::new(mem.read_u32(PA + 0x1008), mem.read_u32(PA + 0x100C));
        assert_eq!(code.base(), PA);
        assert_eq!(code.limit(), 0xFFFF);
    }

    #[test]
    fn every_gate_stub_calls_the_monitor_trap() {
        let mut mem = area(false);
        for vector in [0u32, 0x0D, 0x21, 0x67, 0xFF] {
            let stub = GATE_STUBS_OFFSET + vector * 4;
            assert_eq!(mem.read_u8(PA + stub), 0xE8);
            let rel = mem.read_u16(PA + stub + 1);
            assert_eq!((stub + 3 + u32::from(rel)) & 0xFFFF, MONITOR_TRAP_OFFSET);

            let gate = Descriptor::new(
                mem.read_u32(PA + IDT_OFFSET + vector * 8),
                mem.read_u32(PA + IDT_OFFSET + vector * 8 + 4),
            );
            assert!(gate.present());
            assert_eq!(gate.gate_selector(), 0x0C);
            assert_eq!(gate.gate_offset(), stub);
        }
    }

    #[test]
    fn tss_is_cleared_and_sets_the_ring0_stack() {
        let mut mem = area(false);
        assert_eq!(mem.read_u32(PA + TSS_OFFSET + 4), RING0_ESP);
        assert_eq!(mem.read_u32(PA + TSS_OFFSET + 8), u32::from(RING0_SS));
        assert_eq!(mem.read_u16(PA + TSS_OFFSET + 0x66), TSS_IOMAP as u16);
        let map = PA + TSS_OFFSET + TSS_IOMAP;
        assert!((0..TSS_IOMAP_BYTES).all(|i| mem.read_u8(map + i) == 0));
    }

    #[test]
    fn virtual_a20_traps_port_92() {
        let mut mem = area(true);
        let map = PA + TSS_OFFSET + TSS_IOMAP;
        assert_eq!(mem.read_u8(map + 0x12), 0x04);
        assert_eq!(mem.read_u8(map + 0x0C), 0x00);
    }
}

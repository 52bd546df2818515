//! Descriptor-table walking, stack operations and interrupt delivery.
//!
//! This is the slice of 386 protected-mode behaviour the VCPI private area relies on: loading
//! selectors through the GDT/LDT, switching to the ring-0 stack named by the TSS when an
//! interrupt leaves virtual-8086 mode, and the 32-bit `IRET` back into it. Paging is not
//! modelled; linear addresses go straight to the memory bus.

use memory::MemoryBus;

use super::{CpuState, EFlags, SegReg, Segment};

/// Raw 8-byte descriptor as stored in a GDT, LDT or IDT.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub lo: u32,
    pub hi: u32,
}

impl Descriptor {
    pub const fn new(lo: u32, hi: u32) -> Self {
        Self { lo, hi }
    }

    pub fn base(&self) -> u32 {
        (self.lo >> 16) | ((self.hi & 0xFF) << 16) | (self.hi & 0xFF00_0000)
    }

    pub fn limit(&self) -> u32 {
        let raw = (self.lo & 0xFFFF) | (self.hi & 0x000F_0000);
        if self.hi & (1 << 23) != 0 {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    pub fn big(&self) -> bool {
        self.hi & (1 << 22) != 0
    }

    pub fn present(&self) -> bool {
        self.hi & (1 << 15) != 0
    }

    pub fn dpl(&self) -> u8 {
        ((self.hi >> 13) & 3) as u8
    }

    /// Type nibble of a system descriptor or gate.
    pub fn system_type(&self) -> u8 {
        ((self.hi >> 8) & 0xF) as u8
    }

    pub fn gate_selector(&self) -> u16 {
        (self.lo >> 16) as u16
    }

    pub fn gate_offset(&self) -> u32 {
        (self.lo & 0xFFFF) | (self.hi & 0xFFFF_0000)
    }

    pub fn gate_is_32bit(&self) -> bool {
        self.system_type() & 0x8 != 0
    }

    /// Trap gates leave IF alone; interrupt gates clear it.
    pub fn gate_is_trap(&self) -> bool {
        self.system_type() & 0x1 != 0
    }

    pub fn segment(&self, selector: u16) -> Segment {
        Segment {
            selector,
            base: self.base(),
            limit: self.limit(),
            big: self.big(),
        }
    }
}

/// What caused an interrupt to be delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptSource {
    /// `INT n`, or an external request.
    Software,
    /// A processor exception, optionally pushing an error code.
    Exception { error_code: Option<u32> },
}

const TSS_ESP0: u32 = 4;
const TSS_SS0: u32 = 8;
const TSS_BUSY: u32 = 1 << 9;

impl CpuState {
    /// Reads the descriptor named by `selector` from the GDT or, with TI set, the LDT.
    pub fn read_descriptor<B: MemoryBus + ?Sized>(
        &self,
        bus: &mut B,
        selector: u16,
    ) -> Option<Descriptor> {
        let (base, limit) = if selector & 4 != 0 {
            (self.ldtr.base, self.ldtr.limit)
        } else {
            (self.gdtr.base, u32::from(self.gdtr.limit))
        };
        let index = u32::from(selector & !7);
        if index + 7 > limit {
            return None;
        }
        let addr = base.wrapping_add(index);
        Some(Descriptor::new(bus.read_u32(addr), bus.read_u32(addr + 4)))
    }

    /// Loads a segment register according to the current addressing mode. Null or unreadable
    /// selectors leave a zero-based segment behind rather than faulting.
    pub fn load_segment<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, reg: SegReg, selector: u16) {
        if self.real_addressing() {
            self.set_real_seg(reg, selector);
            return;
        }
        let seg = if selector & !3 == 0 {
            None
        } else {
            self.read_descriptor(bus, selector)
                .map(|d| d.segment(selector))
        };
        *self.seg_mut(reg) = seg.unwrap_or(Segment {
            selector,
            ..Segment::default()
        });
    }

    pub fn lldt<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, selector: u16) {
        self.ldtr = match self.read_descriptor(bus, selector & !4) {
            Some(d) if selector & !3 != 0 => d.segment(selector),
            _ => Segment::default(),
        };
    }

    /// Loads the task register and marks the TSS descriptor busy, as `LTR` does.
    pub fn ltr<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, selector: u16) {
        let Some(desc) = self.read_descriptor(bus, selector & !4) else {
            self.tr = Segment::default();
            return;
        };
        self.tr = desc.segment(selector);
        let addr = self.gdtr.base.wrapping_add(u32::from(selector & !7)) + 4;
        bus.write_u32(addr, desc.hi | TSS_BUSY);
    }

    fn adjust_sp(&mut self, delta: i32) {
        if self.ss.big {
            self.esp = self.esp.wrapping_add(delta as u32);
        } else {
            self.set_sp(self.sp().wrapping_add(delta as u16));
        }
    }

    pub fn push16<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, val: u16) {
        self.adjust_sp(-2);
        bus.write_u16(self.stack_top(), val);
    }

    pub fn push32<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, val: u32) {
        self.adjust_sp(-4);
        bus.write_u32(self.stack_top(), val);
    }

    pub fn pop16<B: MemoryBus + ?Sized>(&mut self, bus: &mut B) -> u16 {
        let val = bus.read_u16(self.stack_top());
        self.adjust_sp(2);
        val
    }

    pub fn pop32<B: MemoryBus + ?Sized>(&mut self, bus: &mut B) -> u32 {
        let val = bus.read_u32(self.stack_top());
        self.adjust_sp(4);
        val
    }

    /// Delivers interrupt `vector`.
    ///
    /// In real mode this is the 8086 sequence through the IVT. Otherwise the IDT gate is used;
    /// leaving virtual-8086 mode switches to the ring-0 stack from the TSS and saves the V86
    /// data segments on it. Returns `false` if the IDT has no usable gate for `vector`.
    pub fn deliver_interrupt<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
        source: InterruptSource,
    ) -> bool {
        if !self.protected_mode() {
            let flags = self.eflags.bits() as u16;
            let cs = self.cs.selector;
            let ip = self.ip();
            self.push16(bus, flags);
            self.push16(bus, cs);
            self.push16(bus, ip);
            self.eflags.remove(EFlags::IF | EFlags::TF);
            let entry = u32::from(vector) * 4;
            let offset = bus.read_u16(entry);
            let segment = bus.read_u16(entry + 2);
            self.set_real_seg(SegReg::Cs, segment);
            self.eip = u32::from(offset);
            self.halted = false;
            return true;
        }

        let slot = u32::from(vector) * 8;
        if slot + 7 > u32::from(self.idtr.limit) {
            return false;
        }
        let gate_addr = self.idtr.base.wrapping_add(slot);
        let gate = Descriptor::new(bus.read_u32(gate_addr), bus.read_u32(gate_addr + 4));
        if !gate.present() {
            return false;
        }
        let target = gate.gate_selector();
        let Some(code) = self.read_descriptor(bus, target) else {
            return false;
        };

        let old_flags = self.eflags.bits();
        let old_cs = self.cs.selector;
        let old_eip = self.eip;
        let old_ss = self.ss.selector;
        let old_esp = self.esp;
        let from_v86 = self.eflags.contains(EFlags::VM);
        let new_cpl = code.dpl();
        let wide = gate.gate_is_32bit();

        let push = |cpu: &mut CpuState, bus: &mut B, val: u32| {
            if wide {
                cpu.push32(bus, val);
            } else {
                cpu.push16(bus, val as u16);
            }
        };

        if from_v86 || new_cpl < self.cpl {
            let tss = self.tr.base;
            let stack_slot = u32::from(new_cpl) * 8;
            let esp0 = bus.read_u32(tss + TSS_ESP0 + stack_slot);
            let ss0 = bus.read_u16(tss + TSS_SS0 + stack_slot);
            let old_segs = [
                self.gs.selector,
                self.fs.selector,
                self.ds.selector,
                self.es.selector,
            ];
            self.eflags.remove(EFlags::VM);
            self.cpl = new_cpl;
            self.load_segment(bus, SegReg::Ss, ss0);
            self.esp = esp0;
            if from_v86 {
                for sel in old_segs {
                    push(self, bus, u32::from(sel));
                }
            }
            push(self, bus, u32::from(old_ss));
            push(self, bus, old_esp);
        }
        push(self, bus, old_flags);
        push(self, bus, u32::from(old_cs));
        push(self, bus, old_eip);
        if let InterruptSource::Exception {
            error_code: Some(code),
        } = source
        {
            push(self, bus, code);
        }

        if from_v86 {
            for reg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
                *self.seg_mut(reg) = Segment::default();
            }
        }
        self.eflags
            .remove(EFlags::TF | EFlags::NT | EFlags::RF | EFlags::VM);
        if !gate.gate_is_trap() {
            self.eflags.remove(EFlags::IF);
        }
        self.cpl = new_cpl;
        self.cs = code.segment((target & !3) | u16::from(new_cpl));
        self.eip = gate.gate_offset();
        self.halted = false;
        true
    }

    /// `IRET` (`operand32 == false`) or `IRETD`.
    pub fn iret<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, operand32: bool) {
        if self.real_addressing() {
            let (ip, cs, flags) = if operand32 {
                let ip = self.pop32(bus);
                let cs = self.pop32(bus) as u16;
                (ip, cs, self.pop32(bus))
            } else {
                let ip = u32::from(self.pop16(bus));
                let cs = self.pop16(bus);
                let flags = u32::from(self.pop16(bus));
                (ip, cs, (self.eflags.bits() & 0xFFFF_0000) | flags)
            };
            let keep = if self.eflags.contains(EFlags::VM) {
                EFlags::VM | EFlags::IOPL
            } else {
                EFlags::empty()
            };
            let new = EFlags::from_bits_retain(flags) | EFlags::FIXED;
            self.eflags = (new - keep) | (self.eflags & keep);
            self.set_real_seg(SegReg::Cs, cs);
            self.eip = ip;
            return;
        }

        let (eip, cs, flags) = if operand32 {
            let eip = self.pop32(bus);
            let cs = self.pop32(bus) as u16;
            (eip, cs, self.pop32(bus))
        } else {
            let eip = u32::from(self.pop16(bus));
            let cs = self.pop16(bus);
            let flags = u32::from(self.pop16(bus));
            (eip, cs, (self.eflags.bits() & 0xFFFF_0000) | flags)
        };
        let new_flags = EFlags::from_bits_retain(flags) | EFlags::FIXED;

        if operand32 && self.cpl == 0 && new_flags.contains(EFlags::VM) {
            let esp = self.pop32(bus);
            let ss = self.pop32(bus) as u16;
            let es = self.pop32(bus) as u16;
            let ds = self.pop32(bus) as u16;
            let fs = self.pop32(bus) as u16;
            let gs = self.pop32(bus) as u16;
            self.eflags = new_flags;
            self.cpl = 3;
            self.set_real_seg(SegReg::Cs, cs);
            self.set_real_seg(SegReg::Ss, ss);
            self.set_real_seg(SegReg::Es, es);
            self.set_real_seg(SegReg::Ds, ds);
            self.set_real_seg(SegReg::Fs, fs);
            self.set_real_seg(SegReg::Gs, gs);
            self.eip = eip & 0xFFFF;
            self.esp = esp;
            return;
        }

        let rpl = (cs & 3) as u8;
        if rpl > self.cpl {
            let (esp, ss) = if operand32 {
                let esp = self.pop32(bus);
                (esp, self.pop32(bus) as u16)
            } else {
                let sp = u32::from(self.pop16(bus));
                (sp, self.pop16(bus))
            };
            self.cpl = rpl;
            self.load_segment(bus, SegReg::Ss, ss);
            self.esp = esp;
        }
        self.eflags = new_flags - EFlags::VM;
        self.load_segment(bus, SegReg::Cs, cs);
        self.eip = eip;
    }

    /// `JMP FAR sel:offset`. In protected mode the new CPL is taken from the selector's RPL.
    pub fn far_jump<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, selector: u16, offset: u32) {
        if !self.real_addressing() {
            self.cpl = (selector & 3) as u8;
        }
        self.load_segment(bus, SegReg::Cs, selector);
        self.eip = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Cr0, DescriptorTable};

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

    #[test]
    fn descriptor_fields() {
        // Base 0x0012_3456, limit 0xFFFF, present data segment, byte granular.
        let d = Descriptor::new(0x3456_FFFF, 0x0000_9212);
        assert_eq!(d.base(), 0x12_3456);
        assert_eq!(d.limit(), 0xFFFF);
        assert!(d.present());
        assert!(!d.big());

        let gate = Descriptor::new(0x000C_2804, 0x0000_EE00);
        assert_eq!(gate.gate_selector(), 0x000C);
        assert_eq!(gate.gate_offset(), 0x2804);
        assert!(gate.gate_is_32bit());
        assert!(!gate.gate_is_trap());
        assert_eq!(gate.dpl(), 3);
    }

    #[test]
    fn real_mode_interrupt_uses_the_ivt() {
        let mut bus = Flat(vec![0; 0x10000]);
        bus.write_u16(0x21 * 4, 0x1234);
        bus.write_u16(0x21 * 4 + 2, 0x0500);
        let mut cpu = CpuState::default();
        cpu.set_real_seg(SegReg::Cs, 0x0100);
        cpu.eip = 0x0010;
        cpu.set_real_seg(SegReg::Ss, 0x0000);
        cpu.esp = 0x8000;
        cpu.eflags |= EFlags::IF;

        assert!(cpu.deliver_interrupt(&mut bus, 0x21, InterruptSource::Software));
        assert_eq!(cpu.cs.selector, 0x0500);
        assert_eq!(cpu.eip, 0x1234);
        assert!(!cpu.flag(EFlags::IF));
        assert_eq!(cpu.sp(), 0x7FFA);
        assert_eq!(bus.read_u16(0x7FFA), 0x0010);
        assert_eq!(bus.read_u16(0x7FFC), 0x0100);

        cpu.iret(&mut bus, false);
        assert_eq!(cpu.cs.selector, 0x0100);
        assert_eq!(cpu.eip, 0x0010);
        assert!(cpu.flag(EFlags::IF));
    }

    #[test]
    fn ltr_marks_the_tss_busy() {
        let mut bus = Flat(vec![0; 0x10000]);
        // GDT at 0x1000 with an available 386 TSS in slot 2.
        bus.write_u32(0x1010, 0x3000_0068);
        bus.write_u32(0x1014, 0x0000_8900);
        let mut cpu = CpuState::default();
        cpu.cr0 |= Cr0::PE;
        cpu.gdtr = DescriptorTable {
            base: 0x1000,
            limit: 0xFF,
        };
        cpu.ltr(&mut bus, 0x10);
        assert_eq!(cpu.tr.base, 0x3000);
        assert_eq!(cpu.tr.limit, 0x68);
        assert_eq!(bus.read_u32(0x1014), 0x0000_8B00);
    }
}

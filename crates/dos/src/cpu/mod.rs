//! Register file of the emulated CPU as seen by the memory managers.
//!
//! Only the state that callback handlers, the VCPI mode switches and the V86 monitor touch is
//! modelled. Segment registers carry their cached base and size so protected-mode selectors
//! resolve without re-reading descriptor tables on every access.

mod protected;

use bitflags::bitflags;

pub use protected::{Descriptor, InterruptSource};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EFlags: u32 {
        const CF = 1 << 0;
        const FIXED = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 3 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Cr0: u32 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

/// Cached state of a segment register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    /// D/B bit: 32-bit default operand size for code, 32-bit stack pointer for stacks.
    pub big: bool,
}

impl Segment {
    /// Segment as loaded in real or virtual-8086 mode.
    pub const fn real(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            big: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuState {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: EFlags,

    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,

    pub cr0: Cr0,
    pub cr2: u32,
    pub cr3: u32,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub ldtr: Segment,
    pub tr: Segment,
    pub cpl: u8,
    pub halted: bool,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: 0,
            eip: 0,
            eflags: EFlags::FIXED,
            es: Segment::real(0),
            cs: Segment::real(0),
            ss: Segment::real(0),
            ds: Segment::real(0),
            fs: Segment::real(0),
            gs: Segment::real(0),
            cr0: Cr0::empty(),
            cr2: 0,
            cr3: 0,
            gdtr: DescriptorTable::default(),
            idtr: DescriptorTable {
                base: 0,
                limit: 0x3FF,
            },
            ldtr: Segment::default(),
            tr: Segment::default(),
            cpl: 0,
            halted: false,
        }
    }
}

impl CpuState {
    pub fn protected_mode(&self) -> bool {
        self.cr0.contains(Cr0::PE)
    }

    pub fn v86_mode(&self) -> bool {
        self.protected_mode() && self.eflags.contains(EFlags::VM)
    }

    /// True when segment registers hold paragraph numbers rather than selectors.
    pub fn real_addressing(&self) -> bool {
        !self.protected_mode() || self.eflags.contains(EFlags::VM)
    }

    pub fn seg(&self, reg: SegReg) -> &Segment {
        match reg {
            SegReg::Es => &self.es,
            SegReg::Cs => &self.cs,
            SegReg::Ss => &self.ss,
            SegReg::Ds => &self.ds,
            SegReg::Fs => &self.fs,
            SegReg::Gs => &self.gs,
        }
    }

    pub fn seg_mut(&mut self, reg: SegReg) -> &mut Segment {
        match reg {
            SegReg::Es => &mut self.es,
            SegReg::Cs => &mut self.cs,
            SegReg::Ss => &mut self.ss,
            SegReg::Ds => &mut self.ds,
            SegReg::Fs => &mut self.fs,
            SegReg::Gs => &mut self.gs,
        }
    }

    /// Loads a segment register the real-mode way (`base = value * 16`).
    pub fn set_real_seg(&mut self, reg: SegReg, value: u16) {
        *self.seg_mut(reg) = Segment::real(value);
    }

    /// Linear address of `seg:off` using the cached segment base.
    pub fn linear(&self, reg: SegReg, off: u32) -> u32 {
        self.seg(reg).base.wrapping_add(off)
    }

    /// Linear address of the current stack top.
    pub fn stack_top(&self) -> u32 {
        self.ss.base.wrapping_add(self.esp & self.stack_mask())
    }

    pub fn stack_mask(&self) -> u32 {
        if self.ss.big {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    pub fn flag(&self, flag: EFlags) -> bool {
        self.eflags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: EFlags, value: bool) {
        self.eflags.set(flag, value);
    }

    pub fn carry(&self) -> bool {
        self.flag(EFlags::CF)
    }

    pub fn set_carry(&mut self, carry: bool) {
        self.set_flag(EFlags::CF, carry);
    }

    pub fn iopl(&self) -> u8 {
        ((self.eflags.bits() >> 12) & 3) as u8
    }

    pub fn ip(&self) -> u16 {
        self.eip as u16
    }

    pub fn set_ip(&mut self, val: u16) {
        self.eip = val as u32;
    }

    pub fn ax(&self) -> u16 {
        self.eax as u16
    }

    pub fn set_ax(&mut self, val: u16) {
        self.eax = (self.eax & 0xFFFF_0000) | (val as u32);
    }

    pub fn ah(&self) -> u8 {
        (self.eax >> 8) as u8
    }

    pub fn set_ah(&mut self, val: u8) {
        self.eax = (self.eax & 0xFFFF_00FF) | ((val as u32) << 8);
    }

    pub fn al(&self) -> u8 {
        self.eax as u8
    }

    pub fn set_al(&mut self, val: u8) {
        self.eax = (self.eax & 0xFFFF_FF00) | (val as u32);
    }

    pub fn bx(&self) -> u16 {
        self.ebx as u16
    }

    pub fn set_bx(&mut self, val: u16) {
        self.ebx = (self.ebx & 0xFFFF_0000) | (val as u32);
    }

    pub fn bh(&self) -> u8 {
        (self.ebx >> 8) as u8
    }

    pub fn set_bh(&mut self, val: u8) {
        self.ebx = (self.ebx & 0xFFFF_00FF) | ((val as u32) << 8);
    }

    pub fn bl(&self) -> u8 {
        self.ebx as u8
    }

    pub fn set_bl(&mut self, val: u8) {
        self.ebx = (self.ebx & 0xFFFF_FF00) | (val as u32);
    }

    pub fn cx(&self) -> u16 {
        self.ecx as u16
    }

    pub fn set_cx(&mut self, val: u16) {
        self.ecx = (self.ecx & 0xFFFF_0000) | (val as u32);
    }

    pub fn ch(&self) -> u8 {
        (self.ecx >> 8) as u8
    }

    pub fn set_ch(&mut self, val: u8) {
        self.ecx = (self.ecx & 0xFFFF_00FF) | ((val as u32) << 8);
    }

    pub fn cl(&self) -> u8 {
        self.ecx as u8
    }

    pub fn set_cl(&mut self, val: u8) {
        self.ecx = (self.ecx & 0xFFFF_FF00) | (val as u32);
    }

    pub fn dx(&self) -> u16 {
        self.edx as u16
    }

    pub fn set_dx(&mut self, val: u16) {
        self.edx = (self.edx & 0xFFFF_0000) | (val as u32);
    }

    pub fn dh(&self) -> u8 {
        (self.edx >> 8) as u8
    }

    pub fn set_dh(&mut self, val: u8) {
        self.edx = (self.edx & 0xFFFF_00FF) | ((val as u32) << 8);
    }

    pub fn dl(&self) -> u8 {
        self.edx as u8
    }

    pub fn set_dl(&mut self, val: u8) {
        self.edx = (self.edx & 0xFFFF_FF00) | (val as u32);
    }

    pub fn si(&self) -> u16 {
        self.esi as u16
    }

    pub fn set_si(&mut self, val: u16) {
        self.esi = (self.esi & 0xFFFF_0000) | (val as u32);
    }

    pub fn di(&self) -> u16 {
        self.edi as u16
    }

    pub fn set_di(&mut self, val: u16) {
        self.edi = (self.edi & 0xFFFF_0000) | (val as u32);
    }

    pub fn sp(&self) -> u16 {
        self.esp as u16
    }

    pub fn set_sp(&mut self, val: u16) {
        self.esp = (self.esp & 0xFFFF_0000) | (val as u32);
    }

    pub fn bp(&self) -> u16 {
        self.ebp as u16
    }

    pub fn set_bp(&mut self, val: u16) {
        self.ebp = (self.ebp & 0xFFFF_0000) | (val as u32);
    }

    /// General purpose register by its x86 encoding number (`eax`, `ecx`, `edx`, `ebx`, `esp`,
    /// `ebp`, `esi`, `edi`).
    pub fn gpr32(&self, index: u8) -> u32 {
        match index & 7 {
            0 => self.eax,
            1 => self.ecx,
            2 => self.edx,
            3 => self.ebx,
            4 => self.esp,
            5 => self.ebp,
            6 => self.esi,
            _ => self.edi,
        }
    }

    pub fn set_gpr32(&mut self, index: u8, val: u32) {
        match index & 7 {
            0 => self.eax = val,
            1 => self.ecx = val,
            2 => self.edx = val,
            3 => self.ebx = val,
            4 => self.esp = val,
            5 => self.ebp = val,
            6 => self.esi = val,
            _ => self.edi = val,
        }
    }

    /// Control register by number. CR1 and CR4 are not modelled and read as zero.
    pub fn control_register(&self, which: u8) -> Option<u32> {
        match which {
            0 => Some(self.cr0.bits()),
            2 => Some(self.cr2),
            3 => Some(self.cr3),
            1 | 4 => Some(0),
            _ => None,
        }
    }

    pub fn set_control_register(&mut self, which: u8, val: u32) -> bool {
        match which {
            0 => self.cr0 = Cr0::from_bits_retain(val),
            2 => self.cr2 = val,
            3 => self.cr3 = val,
            1 | 4 => {}
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_registers_alias_the_wide_register() {
        let mut cpu = CpuState::default();
        cpu.eax = 0x1234_5678;
        assert_eq!(cpu.ax(), 0x5678);
        assert_eq!(cpu.ah(), 0x56);
        cpu.set_al(0xAA);
        cpu.set_ah(0xBB);
        assert_eq!(cpu.eax, 0x1234_BBAA);
        cpu.set_dx(0xFFFF);
        cpu.set_dh(0x12);
        assert_eq!(cpu.edx, 0x12FF);
    }

    #[test]
    fn real_segments_and_stack_top() {
        let mut cpu = CpuState::default();
        cpu.set_real_seg(SegReg::Ss, 0x2000);
        cpu.esp = 0x1_0010;
        assert_eq!(cpu.stack_top(), 0x20010);
        assert!(cpu.real_addressing());

        cpu.cr0 |= Cr0::PE;
        assert!(!cpu.real_addressing());
        cpu.eflags |= EFlags::VM;
        assert!(cpu.v86_mode());
        assert!(cpu.real_addressing());
    }

    #[test]
    fn iopl_is_a_two_bit_field() {
        let mut cpu = CpuState::default();
        cpu.eflags = EFlags::from_bits_retain(0x23002);
        assert_eq!(cpu.iopl(), 3);
        assert!(cpu.flag(EFlags::VM));
        assert!(!cpu.flag(EFlags::IF));
    }
}

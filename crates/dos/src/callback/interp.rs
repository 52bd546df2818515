//! A small x86 interpreter for the code the memory managers run inside the guest.
//!
//! It covers what callback stubs, the run-real-interrupt block, the VCPI descriptor tables and
//! simple guest handlers need: register moves and ALU ops, stack operations, near and far
//! control flow, `INT`/`IRET`, port I/O and control register moves. Memory operands are not
//! supported. Virtual-8086 sensitive instructions raise #GP through the IDT the way a 386 does,
//! which is how the V86 monitor gets to see them.

use iced_x86::{Code, ConditionCode, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use memory::MemoryBus;
use tracing::{error, trace};

use super::stubs::TRAP_OPCODE;
use crate::cpu::{CpuState, EFlags, InterruptSource, SegReg};
use crate::error::{FatalError, Result};
use crate::machine::Machine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Continue,
    /// A callback trap was executed; the machine dispatches the slot's handler.
    Callback(u16),
    Halt,
}

/// Executes guest instructions on behalf of [`Machine`]. Engines are stateless so the machine
/// can hand itself out mutably while stepping.
pub trait ExecutionEngine {
    fn step(&self, machine: &mut Machine) -> Result<ExecOutcome>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StubInterpreter;

impl ExecutionEngine for StubInterpreter {
    fn step(&self, m: &mut Machine) -> Result<ExecOutcome> {
        let code32 = !m.cpu.real_addressing() && m.cpu.cs.big;
        let ip = if code32 { m.cpu.eip } else { m.cpu.eip & 0xFFFF };
        let mut bytes = [0u8; 15];
        let lin = m.cpu.linear(SegReg::Cs, ip);
        m.mem.read_bytes(lin, &mut bytes);

        if bytes[..2] == TRAP_OPCODE {
            m.cpu.eip = advance(ip, 4, code32);
            return Ok(ExecOutcome::Callback(u16::from_le_bytes([bytes[2], bytes[3]])));
        }

        let bitness = if code32 { 32 } else { 16 };
        let mut decoder = Decoder::with_ip(bitness, &bytes, u64::from(ip), DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(unknown(m, bytes[0]));
        }
        let next = advance(ip, instr.len() as u32, code32);
        trace!(cs = m.cpu.cs.selector, ip, ?instr, "step");

        if m.cpu.v86_mode() && faults_in_v86(m, &instr) {
            return general_protection(m);
        }
        match exec(m, &instr, next) {
            Err(FatalError::UnknownInstruction { .. }) => Err(unknown(m, bytes[0])),
            other => other,
        }
    }
}

fn advance(ip: u32, len: u32, code32: bool) -> u32 {
    let next = ip.wrapping_add(len);
    if code32 {
        next
    } else {
        next & 0xFFFF
    }
}

fn unknown(m: &Machine, opcode: u8) -> FatalError {
    let (cs, ip) = (m.cpu.cs.selector, m.cpu.eip as u16);
    error!(cs, ip, opcode, "stub interpreter cannot execute instruction");
    FatalError::UnknownInstruction { cs, ip, opcode }
}

fn unsupported() -> FatalError {
    FatalError::UnknownInstruction {
        cs: 0,
        ip: 0,
        opcode: 0,
    }
}

/// Instructions that trap to the monitor when executed in virtual-8086 mode.
fn faults_in_v86(m: &mut Machine, instr: &Instruction) -> bool {
    if instr.has_lock_prefix() {
        return true;
    }
    let iopl_sensitive = m.cpu.iopl() < 3;
    match instr.mnemonic() {
        Mnemonic::Hlt => true,
        Mnemonic::Mov => matches!(instr.code(), Code::Mov_r32_cr | Code::Mov_cr_r32),
        Mnemonic::Cli
        | Mnemonic::Sti
        | Mnemonic::Pushf
        | Mnemonic::Pushfd
        | Mnemonic::Popf
        | Mnemonic::Popfd
        | Mnemonic::Int
        | Mnemonic::Int3
        | Mnemonic::Iret
        | Mnemonic::Iretd => iopl_sensitive,
        Mnemonic::In | Mnemonic::Out => {
            let (port, size) = port_operand(&m.cpu, instr);
            !m.io_permitted(port, size)
        }
        _ => false,
    }
}

fn general_protection(m: &mut Machine) -> Result<ExecOutcome> {
    deliver(
        m,
        0x0D,
        InterruptSource::Exception {
            error_code: Some(0),
        },
    )?;
    Ok(ExecOutcome::Continue)
}

fn deliver(m: &mut Machine, vector: u8, source: InterruptSource) -> Result<()> {
    if m.cpu.deliver_interrupt(&mut m.mem, vector, source) {
        Ok(())
    } else {
        error!(vector, "no usable interrupt gate");
        Err(FatalError::MissingInterruptGate(vector))
    }
}

fn seg_reg(reg: Register) -> Option<SegReg> {
    Some(match reg {
        Register::ES => SegReg::Es,
        Register::CS => SegReg::Cs,
        Register::SS => SegReg::Ss,
        Register::DS => SegReg::Ds,
        Register::FS => SegReg::Fs,
        Register::GS => SegReg::Gs,
        _ => return None,
    })
}

fn read_reg(cpu: &CpuState, reg: Register) -> Result<u32> {
    if let Some(seg) = seg_reg(reg) {
        return Ok(u32::from(cpu.seg(seg).selector));
    }
    if !reg.is_gpr() {
        return Err(unsupported());
    }
    let n = reg.number() as u8;
    Ok(match reg.size() {
        1 if n < 4 => cpu.gpr32(n) & 0xFF,
        1 => (cpu.gpr32(n - 4) >> 8) & 0xFF,
        2 => cpu.gpr32(n) & 0xFFFF,
        _ => cpu.gpr32(n),
    })
}

fn write_reg(m: &mut Machine, reg: Register, val: u32) -> Result<()> {
    if let Some(seg) = seg_reg(reg) {
        load_seg(m, seg, val as u16);
        return Ok(());
    }
    if !reg.is_gpr() {
        return Err(unsupported());
    }
    let cpu = &mut m.cpu;
    let n = reg.number() as u8;
    match reg.size() {
        1 if n < 4 => {
            let old = cpu.gpr32(n);
            cpu.set_gpr32(n, (old & !0xFF) | (val & 0xFF));
        }
        1 => {
            let old = cpu.gpr32(n - 4);
            cpu.set_gpr32(n - 4, (old & !0xFF00) | ((val & 0xFF) << 8));
        }
        2 => {
            let old = cpu.gpr32(n);
            cpu.set_gpr32(n, (old & !0xFFFF) | (val & 0xFFFF));
        }
        _ => cpu.set_gpr32(n, val),
    }
    Ok(())
}

fn load_seg(m: &mut Machine, seg: SegReg, selector: u16) {
    if m.cpu.real_addressing() {
        m.cpu.set_real_seg(seg, selector);
    } else {
        m.cpu.load_segment(&mut m.mem, seg, selector);
    }
}

fn operand(cpu: &CpuState, instr: &Instruction, idx: u32) -> Result<u32> {
    match instr.op_kind(idx) {
        OpKind::Register => read_reg(cpu, instr.op_register(idx)),
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32 => Ok(instr.immediate(idx) as u32),
        _ => Err(unsupported()),
    }
}

fn dest_register(instr: &Instruction) -> Result<Register> {
    if instr.op0_kind() == OpKind::Register {
        Ok(instr.op0_register())
    } else {
        Err(unsupported())
    }
}

fn port_operand(cpu: &CpuState, instr: &Instruction) -> (u16, u8) {
    let (port_idx, data_reg) = if instr.mnemonic() == Mnemonic::In {
        (1, instr.op0_register())
    } else {
        (0, instr.op1_register())
    };
    let port = if instr.op_kind(port_idx) == OpKind::Immediate8 {
        u16::from(instr.immediate8())
    } else {
        cpu.dx()
    };
    (port, data_reg.size() as u8)
}

fn condition(cpu: &CpuState, cc: ConditionCode) -> bool {
    let f = |flag| cpu.flag(flag);
    match cc {
        ConditionCode::o => f(EFlags::OF),
        ConditionCode::no => !f(EFlags::OF),
        ConditionCode::b => f(EFlags::CF),
        ConditionCode::ae => !f(EFlags::CF),
        ConditionCode::e => f(EFlags::ZF),
        ConditionCode::ne => !f(EFlags::ZF),
        ConditionCode::be => f(EFlags::CF) || f(EFlags::ZF),
        ConditionCode::a => !f(EFlags::CF) && !f(EFlags::ZF),
        ConditionCode::s => f(EFlags::SF),
        ConditionCode::ns => !f(EFlags::SF),
        ConditionCode::p => f(EFlags::PF),
        ConditionCode::np => !f(EFlags::PF),
        ConditionCode::l => f(EFlags::SF) != f(EFlags::OF),
        ConditionCode::ge => f(EFlags::SF) == f(EFlags::OF),
        ConditionCode::le => f(EFlags::ZF) || f(EFlags::SF) != f(EFlags::OF),
        ConditionCode::g => !f(EFlags::ZF) && f(EFlags::SF) == f(EFlags::OF),
        ConditionCode::None => true,
    }
}

/// Integer ALU with CF/ZF/SF/OF. PF and AF are left alone.
fn alu(cpu: &mut CpuState, op: Mnemonic, a: u32, b: u32, bytes: usize) -> u32 {
    let bits = (bytes * 8) as u32;
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
    let sign = 1u32 << (bits - 1);
    let (a, b) = (a & mask, b & mask);
    let (result, carry, overflow) = match op {
        Mnemonic::Add => {
            let r = a.wrapping_add(b) & mask;
            let carry = u64::from(a) + u64::from(b) > u64::from(mask);
            (r, Some(carry), (a ^ r) & (b ^ r) & sign != 0)
        }
        Mnemonic::Sub | Mnemonic::Cmp => {
            let r = a.wrapping_sub(b) & mask;
            (r, Some(a < b), (a ^ b) & (a ^ r) & sign != 0)
        }
        Mnemonic::Inc => {
            let r = a.wrapping_add(1) & mask;
            (r, None, r == sign)
        }
        Mnemonic::Dec => {
            let r = a.wrapping_sub(1) & mask;
            (r, None, a == sign)
        }
        Mnemonic::And | Mnemonic::Test => (a & b, Some(false), false),
        Mnemonic::Or => (a | b, Some(false), false),
        _ => (a ^ b, Some(false), false),
    };
    if let Some(carry) = carry {
        cpu.set_flag(EFlags::CF, carry);
    }
    cpu.set_flag(EFlags::OF, overflow);
    cpu.set_flag(EFlags::ZF, result == 0);
    cpu.set_flag(EFlags::SF, result & sign != 0);
    result
}

fn push(m: &mut Machine, size: i32, val: u32) {
    if size == 4 {
        m.cpu.push32(&mut m.mem, val);
    } else {
        m.cpu.push16(&mut m.mem, val as u16);
    }
}

fn pop(m: &mut Machine, size: i32) -> u32 {
    if size == 4 {
        m.cpu.pop32(&mut m.mem)
    } else {
        u32::from(m.cpu.pop16(&mut m.mem))
    }
}

/// Flags a `POPF` may change. VM and RF never; IOPL only at CPL 0; IF only with enough
/// privilege.
fn popf_mask(cpu: &CpuState) -> EFlags {
    let mut mask = EFlags::all() - EFlags::VM - EFlags::RF - EFlags::FIXED;
    if cpu.cpl > 0 || cpu.v86_mode() {
        mask -= EFlags::IOPL;
    }
    if cpu.protected_mode() && cpu.cpl > cpu.iopl() {
        mask -= EFlags::IF;
    }
    mask
}

fn exec(m: &mut Machine, instr: &Instruction, next: u32) -> Result<ExecOutcome> {
    let mut target = next;
    match instr.mnemonic() {
        Mnemonic::Nop => {}
        Mnemonic::Cli => m.cpu.set_flag(EFlags::IF, false),
        Mnemonic::Sti => m.cpu.set_flag(EFlags::IF, true),
        Mnemonic::Clc => m.cpu.set_flag(EFlags::CF, false),
        Mnemonic::Stc => m.cpu.set_flag(EFlags::CF, true),
        Mnemonic::Cmc => {
            let cf = m.cpu.carry();
            m.cpu.set_carry(!cf);
        }
        Mnemonic::Cld => m.cpu.set_flag(EFlags::DF, false),
        Mnemonic::Std => m.cpu.set_flag(EFlags::DF, true),
        Mnemonic::Hlt => {
            m.cpu.eip = next;
            m.cpu.halted = true;
            return Ok(ExecOutcome::Halt);
        }

        Mnemonic::Mov => match instr.code() {
            Code::Mov_r32_cr => {
                let cr = instr.op1_register() as u32 - Register::CR0 as u32;
                let val = m.cpu.control_register(cr as u8).ok_or_else(unsupported)?;
                write_reg(m, instr.op0_register(), val)?;
            }
            Code::Mov_cr_r32 => {
                let cr = instr.op0_register() as u32 - Register::CR0 as u32;
                let val = read_reg(&m.cpu, instr.op1_register())?;
                if !m.cpu.set_control_register(cr as u8, val) {
                    return Err(unsupported());
                }
            }
            _ => {
                let val = operand(&m.cpu, instr, 1)?;
                write_reg(m, dest_register(instr)?, val)?;
            }
        },
        Mnemonic::Xchg => {
            let (a, b) = (instr.op0_register(), instr.op1_register());
            let (va, vb) = (read_reg(&m.cpu, a)?, read_reg(&m.cpu, b)?);
            write_reg(m, a, vb)?;
            write_reg(m, b, va)?;
        }

        op @ (Mnemonic::Add
        | Mnemonic::Sub
        | Mnemonic::Cmp
        | Mnemonic::And
        | Mnemonic::Or
        | Mnemonic::Xor
        | Mnemonic::Test) => {
            let dst = dest_register(instr)?;
            let a = read_reg(&m.cpu, dst)?;
            let b = operand(&m.cpu, instr, 1)?;
            let r = alu(&mut m.cpu, op, a, b, dst.size());
            if !matches!(op, Mnemonic::Cmp | Mnemonic::Test) {
                write_reg(m, dst, r)?;
            }
        }
        op @ (Mnemonic::Inc | Mnemonic::Dec) => {
            let dst = dest_register(instr)?;
            let a = read_reg(&m.cpu, dst)?;
            let r = alu(&mut m.cpu, op, a, 1, dst.size());
            write_reg(m, dst, r)?;
        }

        Mnemonic::Push => {
            let size = -instr.stack_pointer_increment();
            let val = operand(&m.cpu, instr, 0)?;
            push(m, size, val);
        }
        Mnemonic::Pop => {
            let size = instr.stack_pointer_increment();
            let val = pop(m, size);
            write_reg(m, dest_register(instr)?, val)?;
        }
        Mnemonic::Pusha | Mnemonic::Pushad => {
            let size = if instr.mnemonic() == Mnemonic::Pushad { 4 } else { 2 };
            let sp = m.cpu.esp;
            for n in 0..8u8 {
                let val = if n == 4 { sp } else { m.cpu.gpr32(n) };
                push(m, size, val);
            }
        }
        Mnemonic::Popa | Mnemonic::Popad => {
            let size = if instr.mnemonic() == Mnemonic::Popad { 4 } else { 2 };
            for n in (0..8u8).rev() {
                let val = pop(m, size);
                if n == 4 {
                    continue;
                }
                if size == 4 {
                    m.cpu.set_gpr32(n, val);
                } else {
                    let old = m.cpu.gpr32(n);
                    m.cpu.set_gpr32(n, (old & !0xFFFF) | val);
                }
            }
        }
        Mnemonic::Pushf | Mnemonic::Pushfd => {
            let size = -instr.stack_pointer_increment();
            let flags = (m.cpu.eflags - EFlags::VM - EFlags::RF).bits();
            push(m, size, flags);
        }
        Mnemonic::Popf | Mnemonic::Popfd => {
            let size = instr.stack_pointer_increment();
            let mut val = EFlags::from_bits_truncate(pop(m, size));
            if size == 2 {
                val = (val & EFlags::from_bits_truncate(0xFFFF)) | (m.cpu.eflags - EFlags::from_bits_truncate(0xFFFF));
            }
            let mask = popf_mask(&m.cpu);
            m.cpu.eflags = (m.cpu.eflags - mask) | (val & mask) | EFlags::FIXED;
        }

        Mnemonic::Jmp => match instr.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 => {
                target = instr.near_branch_target() as u32;
            }
            OpKind::FarBranch16 | OpKind::FarBranch32 => {
                let offset = if instr.op0_kind() == OpKind::FarBranch32 {
                    instr.far_branch32()
                } else {
                    u32::from(instr.far_branch16())
                };
                far_transfer(m, instr.far_branch_selector(), offset);
                return Ok(ExecOutcome::Continue);
            }
            _ => return Err(unsupported()),
        },
        Mnemonic::Call => match instr.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 => {
                let size = -instr.stack_pointer_increment();
                push(m, size, next);
                target = instr.near_branch_target() as u32;
            }
            OpKind::FarBranch16 | OpKind::FarBranch32 => {
                let size = -instr.stack_pointer_increment() / 2;
                let cs = u32::from(m.cpu.cs.selector);
                push(m, size, cs);
                push(m, size, next);
                let offset = if instr.op0_kind() == OpKind::FarBranch32 {
                    instr.far_branch32()
                } else {
                    u32::from(instr.far_branch16())
                };
                far_transfer(m, instr.far_branch_selector(), offset);
                return Ok(ExecOutcome::Continue);
            }
            _ => return Err(unsupported()),
        },
        Mnemonic::Ret => {
            let size = if matches!(instr.code(), Code::Retnw | Code::Retnw_imm16) { 2 } else { 4 };
            target = pop(m, size);
            if instr.op_count() == 1 {
                release_stack(&mut m.cpu, u32::from(instr.immediate16()));
            }
        }
        Mnemonic::Retf => {
            let size = if matches!(instr.code(), Code::Retfw | Code::Retfw_imm16) { 2 } else { 4 };
            let offset = pop(m, size);
            let selector = pop(m, size) as u16;
            if instr.op_count() == 1 {
                release_stack(&mut m.cpu, u32::from(instr.immediate16()));
            }
            far_transfer(m, selector, offset);
            return Ok(ExecOutcome::Continue);
        }
        Mnemonic::Loop => {
            let cx_counter = matches!(instr.code(), Code::Loop_rel8_16_CX | Code::Loop_rel8_32_CX);
            let taken = if cx_counter {
                let cx = m.cpu.cx().wrapping_sub(1);
                m.cpu.set_cx(cx);
                cx != 0
            } else {
                m.cpu.ecx = m.cpu.ecx.wrapping_sub(1);
                m.cpu.ecx != 0
            };
            if taken {
                target = instr.near_branch_target() as u32;
            }
        }
        _ if instr.is_jcc_short_or_near() => {
            if condition(&m.cpu, instr.condition_code()) {
                target = instr.near_branch_target() as u32;
            }
        }

        Mnemonic::Int | Mnemonic::Int3 => {
            let vector = if instr.mnemonic() == Mnemonic::Int3 { 3 } else { instr.immediate8() };
            m.cpu.eip = next;
            m.note_interrupt(vector);
            deliver(m, vector, InterruptSource::Software)?;
            return Ok(ExecOutcome::Continue);
        }
        Mnemonic::Iret | Mnemonic::Iretd => {
            let operand32 = instr.mnemonic() == Mnemonic::Iretd;
            m.cpu.iret(&mut m.mem, operand32);
            return Ok(ExecOutcome::Continue);
        }

        Mnemonic::In => {
            let (port, size) = port_operand(&m.cpu, instr);
            let val = m.port_in(port, size)?;
            write_reg(m, instr.op0_register(), val)?;
        }
        Mnemonic::Out => {
            let (port, size) = port_operand(&m.cpu, instr);
            let val = read_reg(&m.cpu, instr.op1_register())?;
            m.port_out(port, size, val)?;
        }

        _ => return Err(unsupported()),
    }
    m.cpu.eip = target;
    Ok(ExecOutcome::Continue)
}

fn release_stack(cpu: &mut CpuState, bytes: u32) {
    let mask = cpu.stack_mask();
    cpu.esp = (cpu.esp & !mask) | (cpu.esp.wrapping_add(bytes) & mask);
}

fn far_transfer(m: &mut Machine, selector: u16, offset: u32) {
    if m.cpu.real_addressing() {
        m.cpu.set_real_seg(SegReg::Cs, selector);
        m.cpu.eip = offset & 0xFFFF;
    } else {
        m.cpu.far_jump(&mut m.mem, selector, offset);
    }
}

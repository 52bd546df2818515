//! The virtual-8086 monitor.
//!
//! Every IDT gate of the VCPI private area funnels through `call 2E00` into this handler, so the
//! return address on the ring-0 stack identifies the vector. A general-protection fault raised
//! by V86 code is emulated here; anything else is reflected to the guest's real-mode IVT.

use memory::MemoryBus;
use tracing::{error, trace};

use super::vcpi::GATE_STUBS_OFFSET;
use crate::callback::CallbackReturn;
use crate::cpu::{CpuState, EFlags};
use crate::error::{FatalError, Result};
use crate::machine::Machine;

/// Value of SP inside the monitor when it was entered by an interrupt without an error code:
/// the ring-0 stack (2000h) minus nine dwords of V86 frame and the stub's return address.
pub const INTERRUPT_FRAME_SP: u16 = 0x1FDA;

/// Return address pushed by the stub of vector 0.
const STUB_RETURN_BASE: u16 = GATE_STUBS_OFFSET as u16 + 3;
const GP_FAULT: u16 = 0x0D * 4;

fn stack_addr(cpu: &CpuState, delta: u32) -> u32 {
    cpu.ss.base.wrapping_add(cpu.esp.wrapping_add(delta) & cpu.stack_mask())
}

impl Machine {
    pub(crate) fn v86_monitor(&mut self) -> Result<CallbackReturn> {
        let ret = self.mem.read_u16(stack_addr(&self.cpu, 0));
        let int_num = ret.wrapping_sub(STUB_RETURN_BASE);

        if int_num == GP_FAULT && self.cpu.sp() != INTERRUPT_FRAME_SP {
            // Return address of the stub and the fault's error code.
            self.cpu.esp = self.cpu.esp.wrapping_add(6);
            self.emulate_faulting_instruction()?;
        } else {
            self.reflect_interrupt(int_num);
        }
        Ok(CallbackReturn::Next)
    }

    fn emulate_faulting_instruction(&mut self) -> Result<()> {
        let ip_addr = stack_addr(&self.cpu, 0);
        let ip = self.mem.read_u16(ip_addr);
        let cs = self.mem.read_u16(stack_addr(&self.cpu, 4));
        let at = (u32::from(cs) << 4).wrapping_add(u32::from(ip));
        let opcode = self.mem.read_u8(at);
        trace!(cs, ip, opcode, "V86 monitor: protection fault");

        let len: u16 = match opcode {
            0x0F => {
                let second = self.mem.read_u8(at + 1);
                let modrm = self.mem.read_u8(at + 2);
                if !matches!(second, 0x20 | 0x22) {
                    error!(cs, ip, second, "V86 monitor: unhandled 0F opcode");
                    return Err(FatalError::UnhandledV86Opcode { cs, ip, opcode: second });
                }
                if !(0xC0..0xE8).contains(&modrm) {
                    error!(cs, ip, modrm, "V86 monitor: invalid control register access");
                    return Err(FatalError::InvalidCrAccess);
                }
                let which = (modrm >> 3) & 7;
                let reg = modrm & 7;
                if second == 0x20 {
                    let val = self.cpu.control_register(which).ok_or(FatalError::InvalidCrAccess)?;
                    self.cpu.set_gpr32(reg, val);
                } else {
                    let mut val = self.cpu.gpr32(reg);
                    if which == 0 {
                        val |= 1;
                    }
                    if !self.cpu.set_control_register(which, val) {
                        error!(which, "V86 monitor: invalid control register write");
                        return Err(FatalError::InvalidCrAccess);
                    }
                }
                3
            }
            0xE4 | 0xE5 => {
                let port = u16::from(self.mem.read_u8(at + 1));
                let size = if opcode == 0xE4 { 1 } else { 2 };
                let val = self.monitor_port_in(port, size)?;
                self.store_accumulator(size, val);
                2
            }
            0xE6 | 0xE7 => {
                let port = u16::from(self.mem.read_u8(at + 1));
                let size = if opcode == 0xE6 { 1 } else { 2 };
                let val = self.load_accumulator(size);
                self.monitor_port_out(port, size, val)?;
                2
            }
            0xEC | 0xED => {
                let size = if opcode == 0xEC { 1 } else { 2 };
                let val = self.monitor_port_in(self.cpu.dx(), size)?;
                self.store_accumulator(size, val);
                1
            }
            0xEE | 0xEF => {
                let size = if opcode == 0xEE { 1 } else { 2 };
                let val = self.load_accumulator(size);
                self.monitor_port_out(self.cpu.dx(), size, val)?;
                1
            }
            // LOCK
            0xF0 => 1,
            0xF4 => {
                self.cpu.set_flag(EFlags::IF, true);
                self.cpu.halted = true;
                1
            }
            _ => {
                error!(cs, ip, opcode, "V86 monitor: unhandled opcode caused a protection fault");
                return Err(FatalError::UnhandledV86Opcode { cs, ip, opcode });
            }
        };
        self.mem.write_u16(ip_addr, ip.wrapping_add(len));
        Ok(())
    }

    fn load_accumulator(&self, size: u8) -> u32 {
        if size == 1 {
            u32::from(self.cpu.al())
        } else {
            u32::from(self.cpu.ax())
        }
    }

    fn store_accumulator(&mut self, size: u8, val: u32) {
        if size == 1 {
            self.cpu.set_al(val as u8);
        } else {
            self.cpu.set_ax(val as u16);
        }
    }

    /// Port reads trapped from V86 code. Port 92h only reports the virtual A20 flag when
    /// virtual A20 is configured.
    fn monitor_port_in(&mut self, port: u16, size: u8) -> Result<u32> {
        if port == 0x92 && self.config.vcpi_virtual_a20 {
            let a20 = if self.virtual_a20 { 2 } else { 0 };
            return Ok(u32::from(self.a20_latch | a20));
        }
        self.port_in(port, size)
    }

    fn monitor_port_out(&mut self, port: u16, size: u8, val: u32) -> Result<()> {
        if port == 0x92 && self.config.vcpi_virtual_a20 {
            if val & 1 != 0 {
                error!("guest requested a reset through port 92h");
                return Err(FatalError::ResetRequested);
            }
            self.a20_latch = (val as u8) & !2;
            self.virtual_a20 = val & 2 != 0;
            trace!(enabled = self.virtual_a20, "virtual A20");
            return Ok(());
        }
        self.port_out(port, size, val)
    }

    /// Rewrites the ring-0 frame so the `iretd` after the monitor trap enters the guest's own
    /// IVT handler, with a real-mode interrupt frame pushed on the V86 stack.
    fn reflect_interrupt(&mut self, int_num: u16) {
        let vector_ofs = self.mem.read_u16(u32::from(int_num));
        let vector_seg = self.mem.read_u16(u32::from(int_num) + 2);
        let skip = if self.cpu.sp() != INTERRUPT_FRAME_SP { 2 + 3 * 4 } else { 2 };
        self.cpu.esp = self.cpu.esp.wrapping_add(skip);

        let cpu = &self.cpu;
        let mem = &mut self.mem;
        let return_ip = mem.read_u16(stack_addr(cpu, 0));
        let return_cs = mem.read_u16(stack_addr(cpu, 4));
        let return_flags = mem.read_u32(stack_addr(cpu, 8));

        mem.write_u32(stack_addr(cpu, 0), u32::from(vector_ofs));
        mem.write_u32(stack_addr(cpu, 4), u32::from(vector_seg));
        mem.write_u32(
            stack_addr(cpu, 8),
            return_flags & !(EFlags::IF | EFlags::TF).bits(),
        );

        let v86_ss = mem.read_u16(stack_addr(cpu, 0x10));
        let v86_sp = mem.read_u16(stack_addr(cpu, 0x0C)).wrapping_sub(6);
        mem.write_u16(stack_addr(cpu, 0x0C), v86_sp);

        let frame = (u32::from(v86_ss) << 4).wrapping_add(u32::from(v86_sp));
        mem.write_u16(frame, return_ip);
        mem.write_u16(frame + 2, return_cs);
        mem.write_u16(frame + 4, return_flags as u16);
        trace!(vector = int_num / 4, seg = vector_seg, ofs = vector_ofs, "V86 monitor: reflect");
    }
}

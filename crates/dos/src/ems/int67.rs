//! INT 67h: the LIM EMS 4.0 register interface. The function is selected by AH and the status
//! is returned in AH.

use memory::{MemoryBus, PcMemory};
use tracing::{debug, warn};

use super::moves::MoveRegion;
use super::vcpi::vcpi_call;
use super::{
    Ems, EmmResult, Mapping, EMM_MAX_HANDLES, EMM_MAX_PHYS, EMM_PAGEFRAME, EMM_PAGE_SIZE, EMM_VERSION,
};
use crate::callback::CallbackReturn;
use crate::cpu::{CpuState, SegReg};
use crate::error::{EmmError, Result};
use crate::machine::Machine;

/// Bytes of a full mapping table as exchanged by function 4Eh.
const MAPPING_TABLE_BYTES: u8 = (EMM_MAX_PHYS * 4) as u8;

fn set_status(cpu: &mut CpuState, result: EmmResult<()>) {
    cpu.set_ah(match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    });
}

fn es_di(cpu: &CpuState) -> u32 {
    cpu.linear(SegReg::Es, u32::from(cpu.di()))
}

fn ds_si(cpu: &CpuState) -> u32 {
    cpu.linear(SegReg::Ds, u32::from(cpu.si()))
}

fn unsupported_subfunction(cpu: &CpuState) -> EmmError {
    warn!("EMS: call {:#04x} subfunction {:#04x} not supported", cpu.ah(), cpu.al());
    EmmError::InvalidSubFunction
}

fn write_mappings(mem: &mut PcMemory, at: u32, table: &[Mapping; EMM_MAX_PHYS]) {
    for (i, m) in table.iter().enumerate() {
        m.write(mem, at + i as u32 * 4);
    }
}

fn read_mappings(mem: &mut PcMemory, at: u32) -> [Mapping; EMM_MAX_PHYS] {
    std::array::from_fn(|i| Mapping::read(mem, at + i as u32 * 4))
}

/// Function 4Eh: get/set the whole frame mapping table.
fn page_map(ems: &mut Ems, cpu: &mut CpuState, mem: &mut PcMemory) -> EmmResult<()> {
    match cpu.al() {
        0x00 => {
            write_mappings(mem, es_di(cpu), &ems.mappings);
            Ok(())
        }
        0x01 => {
            ems.mappings = read_mappings(mem, ds_si(cpu));
            ems.restore_mapping_table(mem)
        }
        0x02 => {
            write_mappings(mem, es_di(cpu), &ems.mappings);
            ems.mappings = read_mappings(mem, ds_si(cpu));
            ems.restore_mapping_table(mem)
        }
        0x03 => {
            cpu.set_al(MAPPING_TABLE_BYTES);
            Ok(())
        }
        _ => Err(unsupported_subfunction(cpu)),
    }
}

enum PartialSlot {
    Frame(usize),
    Segment(usize),
}

fn partial_slot(ems: &Ems, segment: u16) -> EmmResult<PartialSlot> {
    let frame = EMM_PAGEFRAME;
    if (frame..frame.wrapping_add(0x1000)).contains(&segment) {
        return Ok(PartialSlot::Frame(usize::from((segment - frame) / (EMM_PAGE_SIZE >> 4) as u16)));
    }
    if ems.mode.is_remapper()
        || (frame - 0x1000..frame).contains(&segment)
        || (0xA000..0xB000).contains(&segment)
    {
        return Ok(PartialSlot::Segment(usize::from(segment >> 10)));
    }
    Err(EmmError::IllegalPhysicalPage)
}

/// Function 4Fh: save/restore the mappings of selected segments.
fn partial_page_map(ems: &mut Ems, cpu: &mut CpuState, mem: &mut PcMemory) -> EmmResult<()> {
    match cpu.al() {
        0x00 => {
            let mut list = ds_si(cpu);
            let mut data = es_di(cpu);
            let count = mem.read_u16(list);
            list += 2;
            mem.write_u16(data, count);
            data += 2;
            for _ in 0..count {
                let segment = mem.read_u16(list);
                list += 2;
                let mapping = match partial_slot(ems, segment)? {
                    PartialSlot::Frame(i) => ems.mappings[i],
                    PartialSlot::Segment(i) => ems.segment_mappings[i],
                };
                mem.write_u16(data, segment);
                mapping.write(mem, data + 2);
                data += 6;
            }
            Ok(())
        }
        0x01 => {
            let mut data = ds_si(cpu);
            let count = mem.read_u16(data);
            data += 2;
            for _ in 0..count {
                let segment = mem.read_u16(data);
                let mapping = Mapping::read(mem, data + 2);
                match partial_slot(ems, segment)? {
                    PartialSlot::Frame(i) => ems.mappings[i] = mapping,
                    PartialSlot::Segment(i) => ems.segment_mappings[i] = mapping,
                }
                data += 6;
            }
            ems.restore_mapping_table(mem)
        }
        0x02 => {
            cpu.set_al(2u16.wrapping_add(cpu.bx().wrapping_mul(6)) as u8);
            Ok(())
        }
        al => {
            warn!("EMS: call 0x4f subfunction {al:#04x} not supported");
            Err(EmmError::FunctionNotSupported)
        }
    }
}

/// Function 50h: map or unmap several pages of handle DX. Stops at the first failure.
fn map_multiple(ems: &mut Ems, cpu: &mut CpuState, mem: &mut PcMemory) -> EmmResult<()> {
    let by_segment = match cpu.al() {
        0x00 => false,
        0x01 => true,
        _ => return Err(unsupported_subfunction(cpu)),
    };
    let handle = cpu.dx();
    let mut data = ds_si(cpu);
    for _ in 0..cpu.cx() {
        let log_page = mem.read_u16(data);
        let target = mem.read_u16(data + 2);
        data += 4;
        if by_segment {
            ems.map_segment(mem, u32::from(target), handle, log_page)?;
        } else {
            ems.map_page(mem, target, handle, log_page)?;
        }
    }
    Ok(())
}

fn handle_name(ems: &mut Ems, cpu: &mut CpuState, mem: &mut PcMemory) -> EmmResult<()> {
    let handle = cpu.dx();
    match cpu.al() {
        0x00 => {
            let name = ems.handle_name(handle)?;
            mem.write_bytes(es_di(cpu), &name);
            Ok(())
        }
        0x01 => {
            let mut name = [0u8; 8];
            mem.read_bytes(ds_si(cpu), &mut name);
            ems.set_handle_name(handle, name)
        }
        _ => Err(unsupported_subfunction(cpu)),
    }
}

fn handle_directory(ems: &mut Ems, cpu: &mut CpuState, mem: &mut PcMemory) -> EmmResult<()> {
    match cpu.al() {
        0x00 => {
            let mut data = es_di(cpu);
            let mut count = 0u8;
            for (handle, entry) in ems.handles.iter().enumerate() {
                let Some(entry) = entry else { continue };
                mem.write_u16(data, handle as u16);
                mem.write_bytes(data + 2, &entry.name);
                data += 10;
                count += 1;
            }
            cpu.set_al(count);
            Ok(())
        }
        0x01 => {
            let mut name = [0u8; 8];
            mem.read_bytes(ds_si(cpu), &mut name);
            let handle = ems.find_handle(&name)?;
            cpu.set_dx(handle);
            Ok(())
        }
        0x02 => {
            cpu.set_bx(EMM_MAX_HANDLES as u16);
            Ok(())
        }
        _ => Err(unsupported_subfunction(cpu)),
    }
}

fn memory_region(ems: &mut Ems, cpu: &mut CpuState, mem: &mut PcMemory) -> Result<EmmResult<()>> {
    let exchange = match cpu.al() {
        0x00 => false,
        0x01 => true,
        al => {
            warn!("EMS: call 0x57 subfunction {al:#04x} not supported");
            return Ok(Err(EmmError::FunctionNotSupported));
        }
    };
    let region = MoveRegion::read(mem, ds_si(cpu));
    let result = ems.move_region(mem, &region, exchange)?;
    if let Err(e) = result {
        debug!(error = %e, ?region, "EMS: function 57 move failed");
    }
    Ok(result)
}

/// PC-98 function 70h: page frame enable state.
fn pc98_page_frame(ems: &mut Ems, cpu: &mut CpuState) -> EmmResult<()> {
    match (cpu.al(), cpu.bl()) {
        (0x00, _) => {
            cpu.set_al(if ems.frame_enabled { 0 } else { 1 });
            Ok(())
        }
        (0x01, 0x00) => {
            ems.frame_enabled = true;
            Ok(())
        }
        (0x01, 0x01) => {
            ems.frame_enabled = false;
            Ok(())
        }
        _ => Err(unsupported_subfunction(cpu)),
    }
}

/// Runs one INT 67h request against the register file.
pub fn handle_int67(ems: &mut Ems, cpu: &mut CpuState, mem: &mut PcMemory) -> Result<()> {
    debug!(ax = cpu.ax(), bx = cpu.bx(), dx = cpu.dx(), "EMS call");
    let result = match cpu.ah() {
        0x40 => Ok(()),
        0x41 => {
            cpu.set_bx(EMM_PAGEFRAME);
            Ok(())
        }
        0x42 => {
            cpu.set_dx(ems.total_pages(mem));
            cpu.set_bx(ems.free_pages(mem));
            Ok(())
        }
        0x43 => ems.allocate(mem, cpu.bx(), false)?.map(|h| cpu.set_dx(h)),
        0x44 => ems.map_page(mem, u16::from(cpu.al()), cpu.dx(), cpu.bx()),
        0x45 => ems.release(mem, cpu.dx()),
        0x46 => {
            cpu.set_al(EMM_VERSION);
            Ok(())
        }
        0x47 => ems.save_page_map(cpu.dx()),
        0x48 => ems.restore_page_map(mem, cpu.dx()),
        0x4B => {
            cpu.set_bx(ems.handle_count());
            Ok(())
        }
        0x4C => ems
            .handle(cpu.dx())
            .map(|h| h.pages)
            .ok_or(EmmError::InvalidHandle)
            .map(|pages| cpu.set_bx(pages)),
        0x4D => {
            let mut table = es_di(cpu);
            let all = ems.pages_for_all_handles();
            for &(handle, pages) in &all {
                mem.write_u16(table, handle);
                mem.write_u16(table + 2, pages);
                table += 4;
            }
            cpu.set_bx(all.len() as u16);
            Ok(())
        }
        0x4E => page_map(ems, cpu, mem),
        0x4F => partial_page_map(ems, cpu, mem),
        0x50 => map_multiple(ems, cpu, mem),
        0x51 => ems.reallocate(mem, cpu.dx(), cpu.bx()),
        0x53 => handle_name(ems, cpu, mem),
        0x54 => handle_directory(ems, cpu, mem),
        0x57 => memory_region(ems, cpu, mem)?,
        0x58 => {
            if cpu.al() == 0x00 {
                let data = es_di(cpu);
                let step = 0x1000 / EMM_MAX_PHYS as u16;
                for i in 0..EMM_MAX_PHYS as u16 {
                    mem.write_u16(data + u32::from(i) * 4, EMM_PAGEFRAME + step * i);
                    mem.write_u16(data + u32::from(i) * 4 + 2, i);
                }
            }
            cpu.set_cx(EMM_MAX_PHYS as u16);
            Ok(())
        }
        0x5A => {
            if cpu.al() <= 0x01 {
                ems.allocate(mem, cpu.bx(), true)?.map(|h| cpu.set_dx(h))
            } else {
                Err(unsupported_subfunction(cpu))
            }
        }
        0x70 => pc98_page_frame(ems, cpu),
        0xDE => {
            vcpi_call(ems, cpu, mem);
            return Ok(());
        }
        ah => {
            warn!("EMS: call {ah:#04x} not supported");
            Err(EmmError::FunctionNotSupported)
        }
    };
    set_status(cpu, result);
    Ok(())
}

impl Machine {
    pub(crate) fn int67(&mut self) -> Result<CallbackReturn> {
        match self.ems.as_mut() {
            Some(ems) => handle_int67(ems, &mut self.cpu, &mut self.mem)?,
            None => {
                warn!("INT 67h called without an EMS driver");
                self.cpu.set_ah(EmmError::FunctionNotSupported.code());
            }
        }
        Ok(CallbackReturn::Next)
    }
}

//! The `EMMXXXX0` character device and its IOCTL control channel.
//!
//! EMM386-aware software reads the control channel to identify the driver and to import the
//! GEMMIS structure describing how the upper memory area is mapped.

use memory::{MemoryBus, PcMemory, RealPtr};
use tracing::debug;

use super::{Ems, EMM_MINOR_VERSION, EMM_PAGEFRAME4K, EMM_SYSTEM_HANDLE, EMM_VERSION, GEMMIS_VERSION};
use crate::config::EmsMode;
use crate::dos_memory::DosArena;
use crate::error::Result;
use crate::machine::Machine;

pub const DEVICE_NAME: &[u8; 8] = b"EMMXXXX0";
/// Device information word reported by IOCTL 00h.
pub const DEVICE_INFORMATION: u16 = 0xC0C0;

/// Paragraphs of DOS private memory holding the GEMMIS record.
const GEMMIS_PARAGRAPHS: u16 = 0x20;
const GEMMIS_SIZE: u16 = 0x19D;
const FRAME_RECORD: u32 = 6;
const FRAME_TABLE: u32 = 0x0A;

fn write_frame<B: MemoryBus + ?Sized>(bus: &mut B, at: u32, kind: u8, logical: u16, phys: u8, flags: u8) {
    bus.write_u8(at, kind);
    bus.write_u8(at + 1, 0xFF);
    bus.write_u16(at + 2, logical);
    bus.write_u8(at + 4, phys);
    bus.write_u8(at + 5, flags);
}

impl Ems {
    /// Whether the EMM386-only control channel functions are offered.
    pub fn emm386_interface(&self) -> bool {
        self.mode.is_active() && self.mode != EmsMode::Board
    }

    /// Handles a control-channel read of `size` bytes into the buffer at linear `buf`.
    /// Returns the number of bytes transferred, or `None` if the request is refused.
    pub fn ioctl_read(
        &mut self,
        mem: &mut PcMemory,
        dos: &mut DosArena,
        buf: u32,
        size: u16,
    ) -> Result<Option<u16>> {
        let subfunction = mem.read_u8(buf);
        debug!(subfunction, size, "EMMXXXX0 control channel read");
        Ok(match subfunction {
            0x00 if size == 6 => {
                mem.write_u16(buf, 0x0023);
                mem.write_u32(buf + 2, 0);
                Some(6)
            }
            0x01 if self.emm386_interface() && size == 6 => {
                if self.gemmis_seg == 0 {
                    self.gemmis_seg = dos.get_memory(GEMMIS_PARAGRAPHS)?;
                }
                self.write_gemmis(mem);
                mem.write_u32(buf, u32::from(self.gemmis_seg) << 4);
                mem.write_u16(buf + 4, GEMMIS_VERSION);
                Some(6)
            }
            0x02 if self.emm386_interface() && size == 2 => {
                mem.write_u8(buf, EMM_VERSION >> 4);
                mem.write_u8(buf + 1, EMM_MINOR_VERSION);
                Some(2)
            }
            // Minimum and maximum size are reported from version 4.45 on.
            0x03 if self.emm386_interface() && EMM_MINOR_VERSION >= 0x2D && size == 4 => {
                let kb = (mem.pages().total_pages() * 4).min(0xFFFF) as u16;
                mem.write_u16(buf, kb);
                mem.write_u16(buf + 2, 0x80);
                Some(2)
            }
            _ => None,
        })
    }

    /// GEMMIS import record: one frame descriptor per 16 KiB of the first megabyte below
    /// F000h, followed by the system handle.
    fn write_gemmis(&self, mem: &mut PcMemory) {
        let base = RealPtr::new(self.gemmis_seg, 0).linear().raw();
        mem.write_u16(base, 0x0004);
        mem.write_u16(base + 2, GEMMIS_SIZE);
        mem.write_u16(base + 4, GEMMIS_VERSION);
        mem.write_u32(base + 6, 0);

        let frames = base + FRAME_TABLE;
        let ems_first = EMM_PAGEFRAME4K / 4;
        for frct in 0..ems_first {
            write_frame(mem, frames + frct * FRAME_RECORD, 0x00, 0xFFFF, 0xFF, 0xAA);
        }
        for frct in 0..4u32 {
            write_frame(mem, frames + (frct + ems_first) * FRAME_RECORD, 0x03, 0x7FFF, frct as u8, 0x00);
        }
        for frct in (EMM_PAGEFRAME4K + 0x10) / 4..0xF0 / 4 {
            write_frame(mem, frames + frct * FRAME_RECORD, 0x00, 0xFFFF, 0xFF, 0xAA);
        }

        mem.write_u8(base + 0x18A, 0x74);
        // No UMB descriptors follow; one EMS handle record.
        mem.write_u8(base + 0x18B, 0x00);
        mem.write_u8(base + 0x18C, 0x01);
        mem.write_u16(base + 0x18D, EMM_SYSTEM_HANDLE);
        mem.write_u32(base + 0x18F, 0);
        mem.write_u32(base + 0x193, 0);
        let system = self.handle(EMM_SYSTEM_HANDLE);
        match system.and_then(|h| h.memory().map(|m| (h.pages, m))) {
            Some((pages, chain)) => {
                mem.write_u16(base + 0x197, pages.div_ceil(4));
                mem.write_u32(base + 0x199, chain.base());
            }
            None => {
                mem.write_u16(base + 0x197, 0x0001);
                mem.write_u32(base + 0x199, 0x0011_0000);
            }
        }
    }
}

impl Machine {
    /// IOCTL read from the `EMMXXXX0` device. `None` when EMS is not installed or the request
    /// is refused.
    pub fn emm_device_read(&mut self, buf: RealPtr, size: u16) -> Result<Option<u16>> {
        let Some(ems) = self.ems.as_mut() else {
            return Ok(None);
        };
        ems.ioctl_read(&mut self.mem, &mut self.dos, buf.linear().raw(), size)
    }
}

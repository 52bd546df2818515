//! Save-state encoding of the memory subsystem.
//!
//! A snapshot is a fixed sequence of sections, each `tag[8] || len: u32 || payload`, all
//! integers little-endian:
//!
//! | Tag | Contents |
//! |---|---|
//! | `CBTABLE\0` | callback slot kinds and descriptions, the special slot ids |
//! | `MEMPAGES` | page allocator links, linear page map, A20 gate, RAM image |
//! | `DOSMCB\0\0` | DOS arena bookkeeping (the MCBs themselves live in RAM) |
//! | `XMSSTATE` | XMS handle table and HMA/A20 state |
//! | `EMSSTATE` | EMS handles, mapping tables, VCPI PIC mappings and raw pages, port 92h latch |
//!
//! A snapshot is loaded into a machine built from the same [`crate::MemoryConfig`]. Sections
//! are decoded completely before any state is replaced, so a rejected snapshot leaves the
//! machine untouched.

use std::io::{self, Cursor, Read, Write};

use memory::{MemHandle, PageAllocator};
use thiserror::Error;

use crate::callback::CB_MAX;
use crate::config::EmsMode;
use crate::dos_memory::DosArena;
use crate::ems::{EmsHandle, Mapping, EMM_MAX_PHYS, SEGMENT_MAPPINGS};
use crate::machine::Machine;
use crate::xms::XmsBlock;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("expected section {expected:?}, found {found:?}")]
    UnexpectedSection { expected: [u8; 8], found: [u8; 8] },

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),

    #[error("snapshot does not match this machine: {0}")]
    ConfigMismatch(&'static str),

    #[error("guest RAM size mismatch (expected {expected} bytes, found {found} bytes)")]
    RamLenMismatch { expected: u64, found: u64 },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

pub const TAG_CALLBACKS: [u8; 8] = *b"CBTABLE\0";
pub const TAG_MEMORY: [u8; 8] = *b"MEMPAGES";
pub const TAG_DOS: [u8; 8] = *b"DOSMCB\0\0";
pub const TAG_XMS: [u8; 8] = *b"XMSSTATE";
pub const TAG_EMS: [u8; 8] = *b"EMSSTATE";

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(u8::from(v))
    }

    fn write_len_prefixed_bytes_u32(&mut self, bytes: &[u8]) -> Result<()> {
        let len: u32 = bytes
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("length does not fit in u32"))?;
        self.write_u32_le(len)?;
        self.write_all(bytes)?;
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::Corrupt("invalid bool")),
        }
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| SnapshotError::OutOfMemory { len })?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

fn write_section<W: Write>(w: &mut W, tag: [u8; 8], payload: &[u8]) -> Result<()> {
    w.write_all(&tag)?;
    w.write_len_prefixed_bytes_u32(payload)
}

fn read_section<R: Read>(r: &mut R, tag: [u8; 8]) -> Result<Cursor<Vec<u8>>> {
    let mut found = [0u8; 8];
    r.read_exact(&mut found)?;
    if found != tag {
        return Err(SnapshotError::UnexpectedSection {
            expected: tag,
            found,
        });
    }
    let len = r.read_u32_le()? as usize;
    Ok(Cursor::new(r.read_exact_vec(len)?))
}

fn finish(section: &Cursor<Vec<u8>>) -> Result<()> {
    if section.position() != section.get_ref().len() as u64 {
        return Err(SnapshotError::Corrupt("trailing bytes in section"));
    }
    Ok(())
}

fn ems_mode_tag(mode: EmsMode) -> u8 {
    match mode {
        EmsMode::None => 0,
        EmsMode::Mixed => 1,
        EmsMode::Board => 2,
        EmsMode::Emm386 => 3,
    }
}

fn write_mapping(w: &mut Vec<u8>, m: Mapping) -> Result<()> {
    w.write_u16_le(m.handle)?;
    w.write_u16_le(m.page)
}

fn read_mapping<R: Read>(r: &mut R) -> Result<Mapping> {
    Ok(Mapping {
        handle: r.read_u16_le()?,
        page: r.read_u16_le()?,
    })
}

struct CallbackSection {
    slots: Vec<(u8, Option<String>)>,
    special: [u16; 5],
}

struct MemorySection {
    links: Vec<i32>,
    map: Vec<u32>,
    a20: bool,
    ram: Vec<u8>,
}

struct XmsSection {
    handles: Vec<Option<XmsBlock>>,
    hma_exists: bool,
    hma_owned: bool,
    dos_in_hma: bool,
    hma_min: u16,
    global_a20: bool,
    local_a20: u32,
    umb_available: bool,
}

struct EmsSection {
    base_seg: u16,
    gemmis_seg: u16,
    frame_enabled: bool,
    handles: Vec<Option<EmsHandle>>,
    mappings: [Mapping; EMM_MAX_PHYS],
    segment_mappings: [Mapping; SEGMENT_MAPPINGS],
    pics: Option<(u8, u8)>,
    raw_pages: Vec<u32>,
    a20_latch: u8,
    virtual_a20: bool,
}

impl Machine {
    /// Writes the memory subsystem state. CPU registers are not part of it.
    pub fn save_state<W: Write>(&self, w: &mut W) -> Result<()> {
        write_section(w, TAG_CALLBACKS, &self.encode_callbacks()?)?;
        write_section(w, TAG_MEMORY, &self.encode_memory()?)?;
        let mut dos = Vec::new();
        for v in self.dos.raw_parts() {
            dos.write_u16_le(v)?;
        }
        write_section(w, TAG_DOS, &dos)?;
        write_section(w, TAG_XMS, &self.encode_xms()?)?;
        write_section(w, TAG_EMS, &self.encode_ems()?)?;
        Ok(())
    }

    /// Replaces the memory subsystem state with a snapshot taken by [`Machine::save_state`].
    pub fn load_state<R: Read>(&mut self, r: &mut R) -> Result<()> {
        let callbacks = self.decode_callbacks(&mut read_section(r, TAG_CALLBACKS)?)?;
        let memory = self.decode_memory(&mut read_section(r, TAG_MEMORY)?)?;

        let mut section = read_section(r, TAG_DOS)?;
        let mut raw = [0u16; 7];
        for v in &mut raw {
            *v = section.read_u16_le()?;
        }
        finish(&section)?;
        let dos = DosArena::from_raw_parts(raw);

        let xms = self.decode_xms(&mut read_section(r, TAG_XMS)?)?;
        let ems = self.decode_ems(&mut read_section(r, TAG_EMS)?)?;

        if self
            .callbacks
            .restore_slots(callbacks.slots, callbacks.special)
            .is_none()
        {
            return Err(SnapshotError::ConfigMismatch(
                "native callback handler is not registered",
            ));
        }

        *self.mem.pages_mut() = PageAllocator::from_links(memory.links);
        self.mem.linear_map_mut().restore(&memory.map, memory.a20);
        self.mem.phys_write(0, &memory.ram).map_err(|_| SnapshotError::Corrupt("RAM image"))?;
        self.mem.clear_tlb();
        self.dos = dos;

        if let (Some(live), Some(saved)) = (self.xms.as_mut(), xms) {
            live.handles = saved.handles;
            live.hma_exists = saved.hma_exists;
            live.hma_owned = saved.hma_owned;
            live.dos_in_hma = saved.dos_in_hma;
            live.hma_min = saved.hma_min;
            live.global_a20 = saved.global_a20;
            live.local_a20 = saved.local_a20;
            live.umb_available = saved.umb_available;
        }
        if let Some(saved) = ems {
            if let Some(live) = self.ems.as_mut() {
                live.base_seg = saved.base_seg;
                live.gemmis_seg = saved.gemmis_seg;
                live.frame_enabled = saved.frame_enabled;
                live.handles = saved.handles;
                live.mappings = saved.mappings;
                live.segment_mappings = saved.segment_mappings;
                if let (Some(vcpi), Some((pic1, pic2))) = (live.vcpi.as_mut(), saved.pics) {
                    vcpi.pic1 = pic1;
                    vcpi.pic2 = pic2;
                    vcpi.raw_pages = saved.raw_pages.into_iter().collect();
                }
            }
            self.a20_latch = saved.a20_latch;
            self.virtual_a20 = saved.virtual_a20;
        }
        Ok(())
    }

    fn encode_callbacks(&self) -> Result<Vec<u8>> {
        let mut w = Vec::new();
        let slots = self.callbacks.snapshot_slots();
        w.write_u16_le(slots.len() as u16)?;
        for (tag, description) in slots {
            w.write_u8(tag)?;
            match description {
                Some(d) => {
                    w.write_bool(true)?;
                    w.write_len_prefixed_bytes_u32(d.as_bytes())?;
                }
                None => w.write_bool(false)?,
            }
        }
        for id in self.callbacks.special_slots() {
            w.write_u16_le(id)?;
        }
        Ok(w)
    }

    fn decode_callbacks(&self, r: &mut Cursor<Vec<u8>>) -> Result<CallbackSection> {
        let count = r.read_u16_le()?;
        if count != CB_MAX {
            return Err(SnapshotError::Corrupt("callback table size"));
        }
        let mut slots = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let tag = r.read_u8()?;
            let description = if r.read_bool()? {
                let len = r.read_u32_le()? as usize;
                let bytes = r.read_exact_vec(len)?;
                Some(
                    String::from_utf8(bytes)
                        .map_err(|_| SnapshotError::Corrupt("callback description"))?,
                )
            } else {
                None
            };
            slots.push((tag, description));
        }
        let mut special = [0u16; 5];
        for id in &mut special {
            *id = r.read_u16_le()?;
        }
        finish(r)?;
        Ok(CallbackSection { slots, special })
    }

    fn encode_memory(&self) -> Result<Vec<u8>> {
        let mut w = Vec::new();
        let links = self.mem.pages().links();
        w.write_u32_le(links.len() as u32)?;
        for &link in links {
            w.write_u32_le(link as u32)?;
        }
        let map = self.mem.linear_map().entries();
        w.write_u32_le(map.len() as u32)?;
        for &page in map {
            w.write_u32_le(page)?;
        }
        w.write_bool(self.mem.a20_enabled())?;
        let ram = self.mem.ram().as_slice();
        w.write_u64_le(ram.len() as u64)?;
        w.extend_from_slice(ram);
        Ok(w)
    }

    fn decode_memory(&self, r: &mut Cursor<Vec<u8>>) -> Result<MemorySection> {
        let pages = r.read_u32_le()? as usize;
        if pages != self.mem.pages().total_pages() {
            return Err(SnapshotError::ConfigMismatch("page allocator size"));
        }
        let mut links = Vec::with_capacity(pages);
        for _ in 0..pages {
            links.push(r.read_u32_le()? as i32);
        }
        let entries = r.read_u32_le()? as usize;
        if entries != self.mem.linear_map().entries().len() {
            return Err(SnapshotError::Corrupt("linear page map size"));
        }
        let mut map = Vec::with_capacity(entries);
        for _ in 0..entries {
            map.push(r.read_u32_le()?);
        }
        let a20 = r.read_bool()?;
        let found = r.read_u64_le()?;
        let expected = self.mem.size();
        if found != expected {
            return Err(SnapshotError::RamLenMismatch { expected, found });
        }
        let ram = r.read_exact_vec(found as usize)?;
        finish(r)?;
        Ok(MemorySection {
            links,
            map,
            a20,
            ram,
        })
    }

    fn encode_xms(&self) -> Result<Vec<u8>> {
        let mut w = Vec::new();
        let Some(xms) = self.xms.as_ref() else {
            w.write_bool(false)?;
            return Ok(w);
        };
        w.write_bool(true)?;
        w.write_u16_le(xms.handles.len() as u16)?;
        for block in &xms.handles {
            match block {
                Some(b) => {
                    w.write_bool(true)?;
                    w.write_u32_le(b.size_kb)?;
                    w.write_u8(b.locks)?;
                    w.write_u32_le(b.raw_pages())?;
                    w.write_u32_le(b.raw_placeholder())?;
                }
                None => w.write_bool(false)?,
            }
        }
        w.write_bool(xms.hma_exists)?;
        w.write_bool(xms.hma_owned)?;
        w.write_bool(xms.dos_in_hma)?;
        w.write_u16_le(xms.hma_min)?;
        w.write_bool(xms.global_a20)?;
        w.write_u32_le(xms.local_a20)?;
        w.write_bool(xms.umb_available)?;
        Ok(w)
    }

    fn decode_xms(&self, r: &mut Cursor<Vec<u8>>) -> Result<Option<XmsSection>> {
        let present = r.read_bool()?;
        if present != self.xms.is_some() {
            return Err(SnapshotError::ConfigMismatch("XMS driver presence"));
        }
        let Some(live) = self.xms.as_ref() else {
            finish(r)?;
            return Ok(None);
        };
        let count = usize::from(r.read_u16_le()?);
        if count != live.handles.len() {
            return Err(SnapshotError::ConfigMismatch("XMS handle count"));
        }
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            handles.push(if r.read_bool()? {
                let size_kb = r.read_u32_le()?;
                let locks = r.read_u8()?;
                let pages = r.read_u32_le()?;
                let placeholder = r.read_u32_le()?;
                Some(XmsBlock::from_raw(size_kb, locks, pages, placeholder))
            } else {
                None
            });
        }
        let section = XmsSection {
            handles,
            hma_exists: r.read_bool()?,
            hma_owned: r.read_bool()?,
            dos_in_hma: r.read_bool()?,
            hma_min: r.read_u16_le()?,
            global_a20: r.read_bool()?,
            local_a20: r.read_u32_le()?,
            umb_available: r.read_bool()?,
        };
        finish(r)?;
        Ok(Some(section))
    }

    fn encode_ems(&self) -> Result<Vec<u8>> {
        let mut w = Vec::new();
        let Some(ems) = self.ems.as_ref() else {
            w.write_bool(false)?;
            return Ok(w);
        };
        w.write_bool(true)?;
        w.write_u8(ems_mode_tag(ems.mode))?;
        w.write_u16_le(ems.base_seg)?;
        w.write_u16_le(ems.gemmis_seg)?;
        w.write_bool(ems.frame_enabled)?;
        w.write_u16_le(ems.handles.len() as u16)?;
        for handle in &ems.handles {
            let Some(h) = handle else {
                w.write_bool(false)?;
                continue;
            };
            w.write_bool(true)?;
            w.write_u16_le(h.pages)?;
            w.write_u32_le(h.mem.map_or(0, MemHandle::page))?;
            w.extend_from_slice(&h.name);
            match &h.saved_map {
                Some(saved) => {
                    w.write_bool(true)?;
                    for &m in saved {
                        write_mapping(&mut w, m)?;
                    }
                }
                None => w.write_bool(false)?,
            }
        }
        for &m in ems.mappings.iter().chain(ems.segment_mappings.iter()) {
            write_mapping(&mut w, m)?;
        }
        match ems.vcpi.as_ref() {
            Some(vcpi) => {
                w.write_bool(true)?;
                w.write_u8(vcpi.pic1)?;
                w.write_u8(vcpi.pic2)?;
                w.write_u32_le(vcpi.raw_pages.len() as u32)?;
                for page in vcpi.raw_pages() {
                    w.write_u32_le(page)?;
                }
            }
            None => w.write_bool(false)?,
        }
        w.write_u8(self.a20_latch)?;
        w.write_bool(self.virtual_a20)?;
        Ok(w)
    }

    fn decode_ems(&self, r: &mut Cursor<Vec<u8>>) -> Result<Option<EmsSection>> {
        let present = r.read_bool()?;
        if present != self.ems.is_some() {
            return Err(SnapshotError::ConfigMismatch("EMS driver presence"));
        }
        let Some(live) = self.ems.as_ref() else {
            finish(r)?;
            return Ok(None);
        };
        if r.read_u8()? != ems_mode_tag(live.mode) {
            return Err(SnapshotError::ConfigMismatch("EMS mode"));
        }
        let base_seg = r.read_u16_le()?;
        let gemmis_seg = r.read_u16_le()?;
        let frame_enabled = r.read_bool()?;
        let count = usize::from(r.read_u16_le()?);
        if count != live.handles.len() {
            return Err(SnapshotError::Corrupt("EMS handle count"));
        }
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            if !r.read_bool()? {
                handles.push(None);
                continue;
            }
            let pages = r.read_u16_le()?;
            let mem = MemHandle::from_page(r.read_u32_le()?);
            let mut name = [0u8; 8];
            r.read_exact(&mut name)?;
            let saved_map = if r.read_bool()? {
                let mut saved = [Mapping::UNMAPPED; EMM_MAX_PHYS];
                for m in &mut saved {
                    *m = read_mapping(r)?;
                }
                Some(saved)
            } else {
                None
            };
            handles.push(Some(EmsHandle {
                pages,
                mem,
                name,
                saved_map,
            }));
        }
        let mut mappings = [Mapping::UNMAPPED; EMM_MAX_PHYS];
        for m in &mut mappings {
            *m = read_mapping(r)?;
        }
        let mut segment_mappings = [Mapping::UNMAPPED; SEGMENT_MAPPINGS];
        for m in &mut segment_mappings {
            *m = read_mapping(r)?;
        }
        let mut raw_pages = Vec::new();
        let pics = if r.read_bool()? {
            let pics = (r.read_u8()?, r.read_u8()?);
            for _ in 0..r.read_u32_le()? {
                let page = r.read_u32_le()?;
                if page == 0 {
                    return Err(SnapshotError::Corrupt("VCPI raw page"));
                }
                raw_pages.push(page);
            }
            Some(pics)
        } else {
            None
        };
        if pics.is_some() != live.vcpi.is_some() {
            return Err(SnapshotError::ConfigMismatch("VCPI presence"));
        }
        let section = EmsSection {
            base_seg,
            gemmis_seg,
            frame_enabled,
            handles,
            mappings,
            segment_mappings,
            pics,
            raw_pages,
            a20_latch: r.read_u8()?,
            virtual_a20: r.read_bool()?,
        };
        finish(r)?;
        Ok(Some(section))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use memory::MemoryBus;

    fn config() -> MemoryConfig {
        MemoryConfig {
            memory_size_bytes: 4 * 1024 * 1024,
            ..MemoryConfig::default()
        }
    }

    fn snapshot(m: &Machine) -> Vec<u8> {
        let mut out = Vec::new();
        m.save_state(&mut out).unwrap();
        out
    }

    #[test]
    fn sections_are_tagged_in_order() {
        let m = Machine::new(config()).unwrap();
        let bytes = snapshot(&m);
        let mut r = Cursor::new(bytes);
        for tag in [TAG_CALLBACKS, TAG_MEMORY, TAG_DOS, TAG_XMS, TAG_EMS] {
            read_section(&mut r, tag).unwrap();
        }
        assert_eq!(r.position(), r.get_ref().len() as u64);
    }

    #[test]
    fn restores_handles_into_a_fresh_machine() {
        let mut m = Machine::new(config()).unwrap();
        let xms_handle = m.xms.as_mut().unwrap().allocate(&mut m.mem, 64).unwrap();
        let ems = m.ems.as_mut().unwrap();
        let ems_handle = ems.allocate(&mut m.mem, 2, false).unwrap().unwrap();
        ems.map_page(&mut m.mem, 0, ems_handle, 1).unwrap();
        ems.set_handle_name(ems_handle, *b"SAVED\0\0\0").unwrap();
        m.mem.write_u32(0xE0000, 0xCAFE_F00D);
        let bytes = snapshot(&m);

        let mut fresh = Machine::new(config()).unwrap();
        fresh.load_state(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(
            fresh.xms.as_ref().unwrap().block(xms_handle).unwrap().size_kb,
            64
        );
        let ems = fresh.ems.as_ref().unwrap();
        assert_eq!(ems.find_handle(b"SAVED\0\0\0"), Ok(ems_handle));
        assert_eq!(ems.mappings()[0], Mapping { handle: ems_handle, page: 1 });
        assert_eq!(fresh.mem.read_u32(0xE0000), 0xCAFE_F00D);
        assert_eq!(fresh.mem.pages().free_total(), m.mem.pages().free_total());
    }

    #[test]
    fn vcpi_raw_pages_survive_a_restore() {
        let mut m = Machine::new(config()).unwrap();
        m.cpu.set_ax(0xDE04);
        m.run_real_int(0x67).unwrap();
        assert_eq!(m.cpu.ah(), 0);
        let raw = m.cpu.edx;
        let bytes = snapshot(&m);

        let mut fresh = Machine::new(config()).unwrap();
        fresh.load_state(&mut Cursor::new(bytes)).unwrap();
        let vcpi = fresh.ems.as_ref().and_then(|e| e.vcpi()).unwrap();
        assert_eq!(vcpi.raw_pages().collect::<Vec<_>>(), vec![raw >> 12]);
        fresh.cpu.set_ax(0xDE05);
        fresh.cpu.edx = raw;
        fresh.run_real_int(0x67).unwrap();
        assert_eq!(fresh.cpu.ah(), 0);
    }

    #[test]
    fn wrong_tag_is_rejected_without_side_effects() {
        let m = Machine::new(config()).unwrap();
        let mut bytes = snapshot(&m);
        bytes[0] = b'X';
        let mut fresh = Machine::new(config()).unwrap();
        let free = fresh.mem.pages().free_total();
        assert!(matches!(
            fresh.load_state(&mut Cursor::new(bytes)),
            Err(SnapshotError::UnexpectedSection { .. })
        ));
        assert_eq!(fresh.mem.pages().free_total(), free);
    }

    #[test]
    fn memory_size_must_match() {
        let m = Machine::new(config()).unwrap();
        let bytes = snapshot(&m);
        let mut bigger = Machine::new(MemoryConfig {
            memory_size_bytes: 8 * 1024 * 1024,
            ..MemoryConfig::default()
        })
        .unwrap();
        assert!(matches!(
            bigger.load_state(&mut Cursor::new(bytes)),
            Err(SnapshotError::ConfigMismatch("page allocator size"))
        ));
    }

    #[test]
    fn truncated_snapshot_is_an_io_error() {
        let m = Machine::new(config()).unwrap();
        let mut bytes = snapshot(&m);
        bytes.truncate(bytes.len() - 3);
        let mut fresh = Machine::new(config()).unwrap();
        assert!(matches!(
            fresh.load_state(&mut Cursor::new(bytes)),
            Err(SnapshotError::Io(_))
        ));
    }
}

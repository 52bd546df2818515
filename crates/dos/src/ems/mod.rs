//! LIM EMS 4.0 expanded memory manager.
//!
//! Expanded memory lives in 16 KiB logical pages backed by chains of 4 KiB pages from the
//! physical allocator. Mapping a logical page into the E000h frame (or, in the remapper modes,
//! almost any segment below 1 MiB) rewrites four entries of the linear page map.
//!
//! The register-level INT 67h interface is in [`int67`], VCPI and the virtual-8086 monitor in
//! [`vcpi`] and [`v86`], and the `EMMXXXX0` device in [`device`].

pub mod device;
pub mod int67;
pub mod moves;
pub mod v86;
pub mod vcpi;

use memory::{MemHandle, MemoryBus, PcMemory, RealPtr};
use tracing::{debug, error, warn};

use crate::callback::{CallbackReturn, Handler, HandlerObject, StubKind};
use crate::config::{EmsMode, MemoryConfig, SavedMapPolicy};
use crate::error::{EmmError, FatalError, Result};
use crate::machine::Machine;

pub use moves::MoveRegion;
pub use vcpi::Vcpi;

pub const EMM_PAGEFRAME: u16 = 0xE000;
/// First 4 KiB page of the page frame.
pub const EMM_PAGEFRAME4K: u32 = (EMM_PAGEFRAME as u32 * 16) / 4096;
pub const EMM_MAX_HANDLES: usize = 200;
pub const EMM_PAGE_SIZE: u32 = 16 * 1024;
pub const EMM_MAX_PHYS: usize = 4;
pub const EMM_VERSION: u8 = 0x40;
pub const EMM_MINOR_VERSION: u8 = 0x00;
pub const GEMMIS_VERSION: u16 = 0x0001;
pub const EMM_SYSTEM_HANDLE: u16 = 0;
pub const NULL_HANDLE: u16 = 0xFFFF;
pub const NULL_PAGE: u16 = 0xFFFF;
/// Pages (16 KiB) claimed for the system handle at startup.
pub const SYSTEM_HANDLE_PAGES: u16 = 24;

/// Allocator pages per EMS page.
const SUBPAGES: usize = (EMM_PAGE_SIZE / memory::PAGE_SIZE) as usize;
/// Entries in the segment mapping table: one per 16 KiB of the first megabyte.
pub const SEGMENT_MAPPINGS: usize = 0x40;

pub type EmmResult<T> = std::result::Result<T, EmmError>;

/// One entry of a mapping table: which logical page of which handle is mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub handle: u16,
    pub page: u16,
}

impl Mapping {
    pub const UNMAPPED: Mapping = Mapping {
        handle: NULL_HANDLE,
        page: NULL_PAGE,
    };

    pub fn is_mapped(self) -> bool {
        self.handle != NULL_HANDLE
    }

    pub fn read<B: MemoryBus + ?Sized>(bus: &mut B, addr: u32) -> Self {
        Self {
            handle: bus.read_u16(addr),
            page: bus.read_u16(addr + 2),
        }
    }

    pub fn write<B: MemoryBus + ?Sized>(self, bus: &mut B, addr: u32) {
        bus.write_u16(addr, self.handle);
        bus.write_u16(addr + 2, self.page);
    }
}

impl Default for Mapping {
    fn default() -> Self {
        Self::UNMAPPED
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmsHandle {
    pub pages: u16,
    pub(crate) mem: Option<MemHandle>,
    pub name: [u8; 8],
    pub(crate) saved_map: Option<[Mapping; EMM_MAX_PHYS]>,
}

impl EmsHandle {
    pub fn memory(&self) -> Option<MemHandle> {
        self.mem
    }

    pub fn has_saved_map(&self) -> bool {
        self.saved_map.is_some()
    }
}

#[derive(Debug)]
pub struct Ems {
    pub(crate) mode: EmsMode,
    pub(crate) handles: Vec<Option<EmsHandle>>,
    pub(crate) mappings: [Mapping; EMM_MAX_PHYS],
    pub(crate) segment_mappings: [Mapping; SEGMENT_MAPPINGS],
    pub(crate) frame_enabled: bool,
    pub(crate) gemmis_seg: u16,
    release_policy: SavedMapPolicy,
    even_megabyte: bool,
    zero_on_alloc: bool,
    pub(crate) base_seg: u16,
    int67: Option<HandlerObject>,
    pub(crate) vcpi: Option<Vcpi>,
}

impl Ems {
    /// Empty tables. Handle 0 exists from the start and owns no pages yet.
    pub fn new(config: &MemoryConfig) -> Self {
        let mut handles = vec![None; EMM_MAX_HANDLES];
        handles[usize::from(EMM_SYSTEM_HANDLE)] = Some(EmsHandle::default());
        Self {
            mode: config.ems,
            handles,
            mappings: [Mapping::UNMAPPED; EMM_MAX_PHYS],
            segment_mappings: [Mapping::UNMAPPED; SEGMENT_MAPPINGS],
            frame_enabled: true,
            gemmis_seg: 0,
            release_policy: config.ems_release_with_saved_map,
            even_megabyte: config.ems_system_handle_even_megabyte,
            zero_on_alloc: config.zero_memory_on_ems_alloc,
            base_seg: 0,
            int67: None,
            vcpi: None,
        }
    }

    pub fn mode(&self) -> EmsMode {
        self.mode
    }

    /// Segment of the 32-byte driver stub holding the device name and the INT 67h entry.
    pub fn base_segment(&self) -> u16 {
        self.base_seg
    }

    pub fn vcpi(&self) -> Option<&Vcpi> {
        self.vcpi.as_ref()
    }

    pub fn handle(&self, handle: u16) -> Option<&EmsHandle> {
        self.handles.get(usize::from(handle))?.as_ref()
    }

    fn handle_mut(&mut self, handle: u16) -> EmmResult<&mut EmsHandle> {
        self.handles
            .get_mut(usize::from(handle))
            .and_then(Option::as_mut)
            .ok_or(EmmError::InvalidHandle)
    }

    pub fn mappings(&self) -> [Mapping; EMM_MAX_PHYS] {
        self.mappings
    }

    pub fn segment_mapping(&self, segment: u16) -> Mapping {
        self.segment_mappings[usize::from(segment >> 10)]
    }

    pub fn free_pages(&self, mem: &PcMemory) -> u16 {
        (mem.pages().free_total() / SUBPAGES).min(0x7FFF) as u16
    }

    pub fn total_pages(&self, mem: &PcMemory) -> u16 {
        (mem.pages().total_pages() / SUBPAGES).min(0xFFFF) as u16
    }

    pub fn handle_count(&self) -> u16 {
        self.handles.iter().filter(|h| h.is_some()).count() as u16
    }

    /// `(handle, pages)` for every open handle, in handle order.
    pub fn pages_for_all_handles(&self) -> Vec<(u16, u16)> {
        self.handles
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_ref().map(|h| (i as u16, h.pages)))
            .collect()
    }

    /// Opens a handle with `pages` logical pages. Zero pages are only accepted from the EMS 4.0
    /// raw allocation call.
    pub fn allocate(
        &mut self,
        mem: &mut PcMemory,
        pages: u16,
        allow_zero: bool,
    ) -> Result<EmmResult<u16>> {
        if pages == 0 && !allow_zero {
            return Ok(Err(EmmError::ZeroPages));
        }
        if mem.pages().free_total() / SUBPAGES < usize::from(pages) {
            return Ok(Err(EmmError::OutOfLogicalPages));
        }
        let Some(index) = (1..EMM_MAX_HANDLES).find(|&i| self.handles[i].is_none()) else {
            return Ok(Err(EmmError::OutOfHandles));
        };
        let chain = if pages == 0 {
            None
        } else {
            let Some(h) = mem
                .pages_mut()
                .allocate_pages(usize::from(pages) * SUBPAGES, false)
            else {
                error!(pages, "EMS: memory allocation failure");
                return Err(FatalError::AllocationFailure("EMS memory"));
            };
            if self.zero_on_alloc {
                mem.zero_chain(h)?;
            }
            Some(h)
        };
        self.handles[index] = Some(EmsHandle {
            pages,
            mem: chain,
            ..EmsHandle::default()
        });
        debug!(handle = index, pages, "EMS allocate");
        Ok(Ok(index as u16))
    }

    /// (Re)allocates the memory of handle 0. An even-megabyte placement is tried first when
    /// configured, falling back to an ordinary allocation.
    pub fn allocate_system_handle(&mut self, mem: &mut PcMemory, pages: u16) -> Result<EmmResult<()>> {
        if mem.pages().free_total() / SUBPAGES < usize::from(pages) {
            return Ok(Err(EmmError::OutOfLogicalPages));
        }
        let system = self.handles[usize::from(EMM_SYSTEM_HANDLE)].get_or_insert_with(EmsHandle::default);
        if let Some(old) = system.mem.take() {
            mem.pages_mut().release_pages(old);
        }
        let subpages = usize::from(pages) * SUBPAGES;
        let preferred = if self.even_megabyte {
            mem.pages_mut().allocate_pages_in_even_megabyte(subpages)
        } else {
            None
        };
        let Some(chain) = preferred.or_else(|| mem.pages_mut().allocate_pages(subpages, false)) else {
            error!(pages, "EMS: system handle memory allocation failure");
            return Err(FatalError::AllocationFailure("EMS system handle"));
        };
        system.pages = pages;
        system.mem = Some(chain);
        debug!(pages, base = chain.base(), "EMS system handle allocated");
        Ok(Ok(()))
    }

    pub fn reallocate(&mut self, mem: &mut PcMemory, handle: u16, pages: u16) -> EmmResult<()> {
        let entry = self.handle_mut(handle)?;
        let mut chain = entry.mem;
        mem.reallocate_pages(&mut chain, usize::from(pages) * SUBPAGES, false)
            .map_err(|_| EmmError::SoftwareMalfunction)?
            .ok_or(EmmError::OutOfLogicalPages)?;
        let entry = self.handle_mut(handle)?;
        entry.mem = chain;
        entry.pages = pages;
        Ok(())
    }

    /// Closes a handle. Handle 0 is never closed, only emptied.
    pub fn release(&mut self, mem: &mut PcMemory, handle: u16) -> EmmResult<()> {
        let policy = self.release_policy;
        let entry = self.handle_mut(handle)?;
        if entry.saved_map.is_some() && policy == SavedMapPolicy::Strict {
            return Err(EmmError::SaveMapError);
        }
        if let Some(chain) = entry.mem.take() {
            mem.pages_mut().release_pages(chain);
        }
        if handle == EMM_SYSTEM_HANDLE {
            *entry = EmsHandle::default();
        } else {
            self.handles[usize::from(handle)] = None;
        }
        Ok(())
    }

    /// The four allocator pages backing logical page `page` of `handle`.
    fn backing_pages(&self, mem: &PcMemory, handle: u16, page: u16) -> EmmResult<Vec<u32>> {
        let entry = self.handle(handle).ok_or(EmmError::InvalidHandle)?;
        if page >= entry.pages {
            return Err(EmmError::LogicalOutOfRange);
        }
        let chain = entry.mem.ok_or(EmmError::LogicalOutOfRange)?;
        let pages: Vec<u32> = mem
            .pages()
            .chain(chain)
            .skip(usize::from(page) * SUBPAGES)
            .take(SUBPAGES)
            .collect();
        if pages.len() != SUBPAGES {
            return Err(EmmError::SoftwareMalfunction);
        }
        Ok(pages)
    }

    fn map_window(mem: &mut PcMemory, first_page: u32, backing: Option<&[u32]>) {
        for i in 0..SUBPAGES as u32 {
            let target = backing.map_or(first_page + i, |b| b[i as usize]);
            mem.map_page(first_page + i, target);
        }
        mem.clear_tlb();
    }

    /// Maps logical page `page` of `handle` into physical page `phys` of the frame, or unmaps
    /// it when `page` is [`NULL_PAGE`].
    pub fn map_page(&mut self, mem: &mut PcMemory, phys: u16, handle: u16, page: u16) -> EmmResult<()> {
        let phys = usize::from(phys);
        if phys >= EMM_MAX_PHYS {
            return Err(EmmError::IllegalPhysicalPage);
        }
        mem.set_a20(true);
        let window = EMM_PAGEFRAME4K + (phys * SUBPAGES) as u32;
        if page == NULL_PAGE {
            self.mappings[phys] = Mapping::UNMAPPED;
            Self::map_window(mem, window, None);
            return Ok(());
        }
        let backing = self.backing_pages(mem, handle, page)?;
        self.mappings[phys] = Mapping { handle, page };
        Self::map_window(mem, window, Some(&backing));
        Ok(())
    }

    /// Whether `segment` may receive a mapping in the current mode.
    pub fn segment_mappable(&self, segment: u32) -> bool {
        if self.mode.is_remapper() {
            return segment < 0x10000;
        }
        (0xA000..0xB000).contains(&segment)
            || (u32::from(EMM_PAGEFRAME)..u32::from(EMM_PAGEFRAME) + 0x1000).contains(&segment)
    }

    /// Like [`Ems::map_page`] but addressed by segment. Segments inside the page frame update
    /// the frame table, anything else the segment table.
    pub fn map_segment(&mut self, mem: &mut PcMemory, segment: u32, handle: u16, page: u16) -> EmmResult<()> {
        if !self.segment_mappable(segment) {
            return Err(EmmError::IllegalPhysicalPage);
        }
        mem.set_a20(true);
        let frame_slot = (segment as i64 - i64::from(EMM_PAGEFRAME)) / (0x1000 / EMM_MAX_PHYS as i64);
        let in_frame = segment >= u32::from(EMM_PAGEFRAME) && (frame_slot as usize) < EMM_MAX_PHYS;
        let window = segment * 16 / memory::PAGE_SIZE;

        let (mapping, backing) = if page == NULL_PAGE {
            (Mapping::UNMAPPED, None)
        } else {
            let backing = self.backing_pages(mem, handle, page)?;
            (Mapping { handle, page }, Some(backing))
        };
        if in_frame {
            self.mappings[frame_slot as usize] = mapping;
        } else {
            self.segment_mappings[(segment >> 10) as usize] = mapping;
        }
        Self::map_window(mem, window, backing.as_deref());
        Ok(())
    }

    pub fn save_page_map(&mut self, handle: u16) -> EmmResult<()> {
        let mappings = self.mappings;
        let entry = self.handle_mut(handle)?;
        if entry.saved_map.is_some() {
            return Err(EmmError::PageMapSaved);
        }
        entry.saved_map = Some(mappings);
        Ok(())
    }

    pub fn restore_page_map(&mut self, mem: &mut PcMemory, handle: u16) -> EmmResult<()> {
        let entry = self.handle_mut(handle)?;
        let saved = entry.saved_map.take().ok_or(EmmError::NoSavedPageMap)?;
        self.mappings = saved;
        self.restore_mapping_table(mem)
    }

    /// Re-applies both mapping tables to the page map. Entries that no longer resolve are
    /// skipped.
    pub fn restore_mapping_table(&mut self, mem: &mut PcMemory) -> EmmResult<()> {
        let frame = usize::from(EMM_PAGEFRAME >> 10);
        for i in (0..SEGMENT_MAPPINGS).filter(|i| !(frame..frame + EMM_MAX_PHYS).contains(i)) {
            let m = self.segment_mappings[i];
            if let Err(e) = self.map_segment(mem, (i as u32) << 10, m.handle, m.page) {
                if self.segment_mappable((i as u32) << 10) {
                    debug!(segment = i << 10, error = %e, "EMS: stale segment mapping");
                }
            }
        }
        for phys in 0..EMM_MAX_PHYS {
            let m = self.mappings[phys];
            if let Err(e) = self.map_page(mem, phys as u16, m.handle, m.page) {
                debug!(phys, error = %e, "EMS: stale frame mapping");
            }
        }
        Ok(())
    }

    pub fn handle_name(&self, handle: u16) -> EmmResult<[u8; 8]> {
        self.handle(handle)
            .map(|h| h.name)
            .ok_or(EmmError::InvalidHandle)
    }

    pub fn set_handle_name(&mut self, handle: u16, name: [u8; 8]) -> EmmResult<()> {
        self.handle_mut(handle)?.name = name;
        Ok(())
    }

    /// Compares like `strncmp` over 8 bytes: bytes after a NUL do not count.
    pub fn find_handle(&self, name: &[u8; 8]) -> EmmResult<u16> {
        let key = trim_name(name);
        self.handles
            .iter()
            .position(|h| h.as_ref().is_some_and(|h| trim_name(&h.name) == key))
            .map(|i| i as u16)
            .ok_or(EmmError::NotFound)
    }

    /// Drops every handle's memory. Used on shutdown.
    fn release_all(&mut self, mem: &mut PcMemory) {
        for entry in self.handles.iter_mut().flatten() {
            if let Some(chain) = entry.mem.take() {
                mem.pages_mut().release_pages(chain);
            }
        }
    }
}

fn trim_name(name: &[u8; 8]) -> &[u8] {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    &name[..end]
}

impl Machine {
    /// Brings up the virtual DMA stub and, when configured, the EMS driver with VCPI.
    pub(crate) fn install_ems(&mut self) -> Result<()> {
        let mut vdma =
            HandlerObject::install(&mut self.callbacks, &mut self.mem, Handler::Int4B, StubKind::Iret, "Int 4b vdma")?;
        vdma.set_real_vec(&mut self.mem, 0x4B);
        self.vdma = Some(vdma);

        if !self.config.ems.is_active() {
            return Ok(());
        }

        let mut ems = Ems::new(&self.config);
        ems.base_seg = self.dos.get_memory(2)?;
        self.mem.try_write(
            RealPtr::new(ems.base_seg, 0x0A).linear().raw(),
            b"EMMXXXX0\0",
        )?;
        let mut int67 = HandlerObject::install_at(
            &mut self.callbacks,
            &mut self.mem,
            Handler::Int67,
            StubKind::Iret,
            RealPtr::new(ems.base_seg, 4),
            "Int 67 ems",
        )?;
        int67.set_real_vec(&mut self.mem, 0x67);
        ems.int67 = Some(int67);

        let system = ems.allocate_system_handle(&mut self.mem, SYSTEM_HANDLE_PAGES)?;
        if let Err(e) = system {
            warn!(error = %e, "EMS: no memory for the system handle; VCPI disabled");
        }

        if self.config.vcpi_enabled() && system.is_ok() {
            ems.vcpi = Some(Vcpi::install(
                &mut self.callbacks,
                &mut self.mem,
                &ems,
                self.config.vcpi_virtual_a20,
            )?);
        }
        debug!(mode = ?ems.mode, base = ems.base_seg, vcpi = ems.vcpi.is_some(), "EMS installed");
        let start_v86 = self.config.v86_startup && ems.vcpi.is_some();
        self.ems = Some(ems);
        if start_v86 {
            self.enter_v86()?;
        }
        Ok(())
    }

    /// Tears the EMS driver down: clears the driver stub, gives INT 67h back, frees all
    /// expanded memory and drops back to real mode if the CPU was left in V86 mode.
    pub fn shutdown_ems(&mut self) -> Result<()> {
        if let Some(vdma) = self.vdma.take() {
            vdma.uninstall(&mut self.callbacks, &mut self.mem)?;
        }
        let Some(mut ems) = self.ems.take() else {
            return Ok(());
        };
        self.mem
            .try_write(RealPtr::new(ems.base_seg, 0).linear().raw(), &[0u8; 32])?;
        if let Some(int67) = ems.int67.take() {
            int67.uninstall(&mut self.callbacks, &mut self.mem)?;
        }
        ems.release_all(&mut self.mem);

        if let Some(vcpi) = ems.vcpi.take() {
            vcpi.uninstall(&mut self.callbacks, &mut self.mem)?;
            if self.cpu.v86_mode() {
                self.leave_v86();
            }
        }
        debug!("EMS shut down");
        Ok(())
    }

    /// INT 4Bh virtual DMA services. Only the "get version" call is answered.
    pub(crate) fn int4b(&mut self) -> Result<CallbackReturn> {
        match self.cpu.ah() {
            0x81 => {
                self.set_cf(true);
                self.cpu.set_ax(1);
            }
            ah => warn!("Unhandled interrupt 4B function {ah:#04x}"),
        }
        Ok(CallbackReturn::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ems(mode: EmsMode) -> (PcMemory, Ems) {
        let cfg = MemoryConfig {
            ems: mode,
            ..MemoryConfig::default()
        };
        let mut mem = PcMemory::new(8 * 1024 * 1024).unwrap();
        let mut ems = Ems::new(&cfg);
        ems.allocate_system_handle(&mut mem, SYSTEM_HANDLE_PAGES)
            .unwrap()
            .unwrap();
        (mem, ems)
    }

    #[test]
    fn system_handle_prefers_an_even_megabyte() {
        let (_, ems) = ems(EmsMode::Mixed);
        let system = ems.handle(0).unwrap();
        assert_eq!(system.pages, SYSTEM_HANDLE_PAGES);
        let base = system.memory().unwrap().base();
        assert_eq!((base >> 20) % 2, 0);
        assert!(base >= 0x20_0000);
    }

    #[test]
    fn allocation_error_order() {
        let (mut mem, mut ems) = ems(EmsMode::Mixed);
        assert_eq!(ems.allocate(&mut mem, 0, false).unwrap(), Err(EmmError::ZeroPages));
        assert_eq!(
            ems.allocate(&mut mem, 0x7000, false).unwrap(),
            Err(EmmError::OutOfLogicalPages)
        );
        let h = ems.allocate(&mut mem, 0, true).unwrap().unwrap();
        assert_eq!(h, 1);
        assert_eq!(ems.handle(h).unwrap().pages, 0);
        for _ in 2..EMM_MAX_HANDLES {
            ems.allocate(&mut mem, 0, true).unwrap().unwrap();
        }
        assert_eq!(ems.allocate(&mut mem, 1, false).unwrap(), Err(EmmError::OutOfHandles));
    }

    #[test]
    fn map_page_rewrites_the_frame() {
        let (mut mem, mut ems) = ems(EmsMode::Mixed);
        let h = ems.allocate(&mut mem, 2, false).unwrap().unwrap();
        let backing = ems.backing_pages(&mem, h, 1).unwrap();
        mem.phys_write(u64::from(backing[0]) * 4096, b"page one").unwrap();
        mem.set_a20(false);

        ems.map_page(&mut mem, 2, h, 1).unwrap();
        assert!(mem.a20_enabled());
        let mut buf = [0u8; 8];
        mem.read_bytes(0xE8000, &mut buf);
        assert_eq!(&buf, b"page one");
        assert_eq!(ems.mappings()[2], Mapping { handle: h, page: 1 });

        ems.map_page(&mut mem, 2, 0x1234, NULL_PAGE).unwrap();
        assert_eq!(ems.mappings()[2], Mapping::UNMAPPED);
        assert_eq!(mem.translate(0xE8000), 0xE8000);
    }

    #[test]
    fn map_page_errors() {
        let (mut mem, mut ems) = ems(EmsMode::Mixed);
        let h = ems.allocate(&mut mem, 1, false).unwrap().unwrap();
        assert_eq!(ems.map_page(&mut mem, 4, h, 0), Err(EmmError::IllegalPhysicalPage));
        assert_eq!(ems.map_page(&mut mem, 0, 77, 0), Err(EmmError::InvalidHandle));
        assert_eq!(ems.map_page(&mut mem, 0, h, 1), Err(EmmError::LogicalOutOfRange));
    }

    #[test]
    fn board_mode_limits_segment_targets() {
        let (mut mem, mut ems) = ems(EmsMode::Board);
        let h = ems.allocate(&mut mem, 1, false).unwrap().unwrap();
        assert_eq!(ems.map_segment(&mut mem, 0x2000, h, 0), Err(EmmError::IllegalPhysicalPage));
        ems.map_segment(&mut mem, 0xA000, h, 0).unwrap();
        assert_eq!(ems.segment_mapping(0xA000), Mapping { handle: h, page: 0 });
        ems.map_segment(&mut mem, 0xE400, h, 0).unwrap();
        assert_eq!(ems.mappings()[1], Mapping { handle: h, page: 0 });

        let (mut mem, mut ems) = self::ems(EmsMode::Emm386);
        let h = ems.allocate(&mut mem, 1, false).unwrap().unwrap();
        ems.map_segment(&mut mem, 0x2000, h, 0).unwrap();
        assert_eq!(ems.segment_mapping(0x2000), Mapping { handle: h, page: 0 });
    }

    #[test]
    fn save_and_restore_page_map() {
        let (mut mem, mut ems) = ems(EmsMode::Mixed);
        let h = ems.allocate(&mut mem, 4, false).unwrap().unwrap();
        ems.map_page(&mut mem, 0, h, 3).unwrap();
        ems.save_page_map(h).unwrap();
        assert_eq!(ems.save_page_map(h), Err(EmmError::PageMapSaved));

        ems.map_page(&mut mem, 0, h, 1).unwrap();
        ems.restore_page_map(&mut mem, h).unwrap();
        assert_eq!(ems.mappings()[0], Mapping { handle: h, page: 3 });
        let backing = ems.backing_pages(&mem, h, 3).unwrap();
        assert_eq!(mem.translate(0xE0000), u64::from(backing[0]) * 4096);
        assert_eq!(ems.restore_page_map(&mut mem, h), Err(EmmError::NoSavedPageMap));
    }

    #[test]
    fn release_policy_for_saved_maps() {
        let (mut mem, mut ems) = ems(EmsMode::Mixed);
        let h = ems.allocate(&mut mem, 1, false).unwrap().unwrap();
        ems.save_page_map(h).unwrap();
        ems.release(&mut mem, h).unwrap();
        assert!(ems.handle(h).is_none());

        let cfg = MemoryConfig {
            ems_release_with_saved_map: SavedMapPolicy::Strict,
            ..MemoryConfig::default()
        };
        let mut strict = Ems::new(&cfg);
        let h = strict.allocate(&mut mem, 1, false).unwrap().unwrap();
        strict.save_page_map(h).unwrap();
        assert_eq!(strict.release(&mut mem, h), Err(EmmError::SaveMapError));
    }

    #[test]
    fn system_handle_is_emptied_not_closed() {
        let (mut mem, mut ems) = ems(EmsMode::Mixed);
        let free = mem.pages().free_total();
        ems.release(&mut mem, 0).unwrap();
        let system = ems.handle(0).unwrap();
        assert_eq!(system.pages, 0);
        assert_eq!(mem.pages().free_total(), free + usize::from(SYSTEM_HANDLE_PAGES) * SUBPAGES);
    }

    #[test]
    fn reallocate_grows_and_shrinks() {
        let (mut mem, mut ems) = ems(EmsMode::Mixed);
        let h = ems.allocate(&mut mem, 0, true).unwrap().unwrap();
        ems.reallocate(&mut mem, h, 3).unwrap();
        assert_eq!(ems.handle(h).unwrap().pages, 3);
        let chain = ems.handle(h).unwrap().memory().unwrap();
        assert_eq!(mem.pages().allocated_pages(chain), 12);
        ems.reallocate(&mut mem, h, 1).unwrap();
        let chain = ems.handle(h).unwrap().memory().unwrap();
        assert_eq!(mem.pages().allocated_pages(chain), 4);
        assert_eq!(ems.reallocate(&mut mem, 150, 1), Err(EmmError::InvalidHandle));
    }

    #[test]
    fn handle_names() {
        let (mut mem, mut ems) = ems(EmsMode::Mixed);
        let h = ems.allocate(&mut mem, 1, false).unwrap().unwrap();
        ems.set_handle_name(h, *b"GAME\0\0\0\0").unwrap();
        assert_eq!(ems.find_handle(b"GAME\0xyz").unwrap(), h);
        assert_eq!(ems.find_handle(b"OTHER\0\0\0"), Err(EmmError::NotFound));
        assert_eq!(ems.handle_name(h).unwrap(), *b"GAME\0\0\0\0");
        assert_eq!(ems.set_handle_name(99, [0; 8]), Err(EmmError::InvalidHandle));
    }
}

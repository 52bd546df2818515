//! XMS 3.0 driver: extended memory blocks above the HMA, HMA arbitration, A20 reference counting
//! and UMB access.
//!
//! Guests find the driver through INT 2Fh AX=4310h and far-call its entry point with the
//! function number in AH. [`handle_xms_call`] decodes registers; the [`Xms`] methods hold the
//! actual semantics and report guest errors as [`XmsError`].

use memory::{MemHandle, MemoryBus, PcMemory, RealPtr, PAGE_SIZE};
use tracing::{debug, warn};

use crate::callback::{CallbackReturn, CallbackTable, Handler, HandlerObject, StubKind};
use crate::config::MemoryConfig;
use crate::cpu::{CpuState, SegReg};
use crate::dos_memory::{DosArena, UmbLinkGuard, NO_UMB_CHAIN};
use crate::error::{Result, XmsError};
use crate::machine::Machine;

pub const XMS_VERSION: u16 = 0x0300;
pub const XMS_DRIVER_VERSION: u16 = 0x0301;

/// Highest byte a real-mode pointer in a move descriptor may reach (FFFF:FFFF).
const REAL_MOVE_LIMIT: u32 = 0x10FFF0;
/// First byte above the HMA.
const HMA_END: u64 = 0x110000;

pub type XmsResult<T> = std::result::Result<T, XmsError>;

/// One extended memory block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmsBlock {
    pub size_kb: u32,
    pub locks: u8,
    /// Owned page chain; `None` for zero-sized blocks.
    pages: Option<MemHandle>,
    /// Address reported for a zero-sized block: the page the allocator would hand out next.
    placeholder: u32,
}

impl XmsBlock {
    pub fn physical_address(&self) -> u32 {
        match self.pages {
            Some(h) => h.base(),
            None => self.placeholder * PAGE_SIZE,
        }
    }

    pub fn pages(&self) -> Option<MemHandle> {
        self.pages
    }

    pub(crate) fn from_raw(size_kb: u32, locks: u8, pages: u32, placeholder: u32) -> Self {
        Self {
            size_kb,
            locks,
            pages: MemHandle::from_page(pages),
            placeholder,
        }
    }

    pub(crate) fn raw_pages(&self) -> u32 {
        self.pages.map_or(0, MemHandle::page)
    }

    pub(crate) fn raw_placeholder(&self) -> u32 {
        self.placeholder
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleInfo {
    pub lock_count: u8,
    pub free_handles: u16,
    pub size_kb: u32,
}

/// The 16-byte structure AH=0Bh reads from DS:SI.
///
/// A handle of 0 means the matching offset is a `segment:offset` pointer into the first
/// megabyte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveDescriptor {
    pub length: u32,
    pub src_handle: u16,
    pub src_offset: u32,
    pub dst_handle: u16,
    pub dst_offset: u32,
}

impl MoveDescriptor {
    pub fn read<B: MemoryBus + ?Sized>(bus: &mut B, addr: u32) -> Self {
        Self {
            length: bus.read_u32(addr),
            src_handle: bus.read_u16(addr + 4),
            src_offset: bus.read_u32(addr + 6),
            dst_handle: bus.read_u16(addr + 10),
            dst_offset: bus.read_u32(addr + 12),
        }
    }

    pub fn write<B: MemoryBus + ?Sized>(&self, bus: &mut B, addr: u32) {
        bus.write_u32(addr, self.length);
        bus.write_u16(addr + 4, self.src_handle);
        bus.write_u32(addr + 6, self.src_offset);
        bus.write_u16(addr + 10, self.dst_handle);
        bus.write_u32(addr + 12, self.dst_offset);
    }
}

#[derive(Clone, Copy, Debug)]
enum Endpoint {
    Linear(u32),
    Physical(u64),
}

#[derive(Debug)]
pub struct Xms {
    pub(crate) handles: Vec<Option<XmsBlock>>,
    pub(crate) hma_exists: bool,
    pub(crate) hma_owned: bool,
    pub(crate) dos_in_hma: bool,
    pub(crate) hma_min: u16,
    pub(crate) global_a20: bool,
    pub(crate) local_a20: u32,
    pub(crate) umb_available: bool,
    zero_on_alloc: bool,
    entry: Option<HandlerObject>,
    multiplex: Option<HandlerObject>,
}

impl Xms {
    /// A driver with an empty handle table. Handle 0 is reserved.
    pub fn new(config: &MemoryConfig, mem: &PcMemory) -> Self {
        let mut handles = vec![None; config.xms_handle_count()];
        handles[0] = Some(XmsBlock {
            size_kb: 0,
            locks: 0,
            pages: None,
            placeholder: 0,
        });
        Self {
            handles,
            hma_exists: mem.size() >= HMA_END,
            hma_owned: false,
            dos_in_hma: config.dos_in_hma,
            hma_min: config.hma_min_alloc,
            global_a20: false,
            local_a20: 0,
            umb_available: false,
            zero_on_alloc: config.zero_memory_on_xms_alloc,
            entry: None,
            multiplex: None,
        }
    }

    /// Installs the hookable entry point in DOS private memory, the INT 2Fh multiplex handler
    /// and the UMB chain.
    pub fn install(
        config: &MemoryConfig,
        mem: &mut PcMemory,
        callbacks: &mut CallbackTable,
        dos: &mut DosArena,
    ) -> Result<Self> {
        let mut xms = Self::new(config, mem);

        let seg = dos.get_memory(1)? - 1;
        let entry = HandlerObject::install_at(
            callbacks,
            mem,
            Handler::Xms,
            StubKind::Hookable,
            RealPtr::new(seg, 0x10),
            "XMS Handler",
        )?;
        let mut multiplex =
            HandlerObject::install(callbacks, mem, Handler::Multiplex, StubKind::Iret, "XMS Multiplex")?;
        multiplex.set_real_vec(mem, 0x2F);

        dos.build_umb_chain(mem, config.umb, config.umb_start, config.umb_end_segment())?;
        xms.umb_available = config.umb && dos.umb_chain_start() != NO_UMB_CHAIN;

        debug!(entry = %entry.entry(), handles = xms.handles.len(), umb = xms.umb_available, "XMS installed");
        xms.entry = Some(entry);
        xms.multiplex = Some(multiplex);
        Ok(xms)
    }

    /// Releases every block, hands back the callbacks and drops the UMB chain.
    pub fn shutdown(
        mut self,
        mem: &mut PcMemory,
        callbacks: &mut CallbackTable,
        dos: &mut DosArena,
    ) -> Result<()> {
        for block in self.handles.iter_mut().skip(1) {
            if let Some(h) = block.take().and_then(|b| b.pages) {
                mem.pages_mut().release_pages(h);
            }
        }
        dos.detach_umb_chain(mem);
        if let Some(multiplex) = self.multiplex.take() {
            multiplex.uninstall(callbacks, mem)?;
        }
        if let Some(entry) = self.entry.take() {
            entry.uninstall(callbacks, mem)?;
        }
        Ok(())
    }

    pub fn entry_point(&self) -> Option<RealPtr> {
        self.entry.as_ref().map(HandlerObject::entry)
    }

    pub fn block(&self, handle: u16) -> Option<&XmsBlock> {
        if handle == 0 {
            return None;
        }
        self.handles.get(usize::from(handle))?.as_ref()
    }

    fn block_mut(&mut self, handle: u16) -> XmsResult<&mut XmsBlock> {
        if handle == 0 {
            return Err(XmsError::InvalidHandle);
        }
        self.handles
            .get_mut(usize::from(handle))
            .and_then(Option::as_mut)
            .ok_or(XmsError::InvalidHandle)
    }

    pub fn free_handles(&self) -> u16 {
        self.handles.iter().filter(|h| h.is_none()).count() as u16
    }

    pub fn hma_exists(&self) -> bool {
        self.hma_exists
    }

    pub fn hma_owned(&self) -> bool {
        self.hma_owned
    }

    pub fn local_a20_count(&self) -> u32 {
        self.local_a20
    }

    pub fn umb_available(&self) -> bool {
        self.umb_available
    }

    /// `dx` is the requested size in bytes, or FFFFh for a TSR or device driver.
    pub fn request_hma(&mut self, dx: u16) -> XmsResult<()> {
        if !self.hma_exists {
            return Err(XmsError::HmaNotExist);
        }
        if self.dos_in_hma || self.hma_owned {
            return Err(XmsError::HmaInUse);
        }
        if dx != 0xFFFF && dx < self.hma_min {
            return Err(XmsError::HmaTooSmall);
        }
        self.hma_owned = true;
        Ok(())
    }

    pub fn release_hma(&mut self) -> XmsResult<()> {
        if !self.hma_exists {
            return Err(XmsError::HmaNotExist);
        }
        if self.dos_in_hma || !self.hma_owned {
            return Err(XmsError::HmaNotAllocated);
        }
        self.hma_owned = false;
        Ok(())
    }

    pub fn global_enable_a20(&mut self, mem: &mut PcMemory) -> XmsResult<()> {
        self.global_a20 = true;
        mem.set_a20(true);
        Ok(())
    }

    /// The gate only closes once no local enable is outstanding.
    pub fn global_disable_a20(&mut self, mem: &mut PcMemory) -> XmsResult<()> {
        self.global_a20 = false;
        if self.local_a20 > 0 {
            return Err(XmsError::A20StillEnabled);
        }
        mem.set_a20(false);
        Ok(())
    }

    pub fn local_enable_a20(&mut self, mem: &mut PcMemory) -> XmsResult<()> {
        if self.local_a20 == 0 {
            mem.set_a20(true);
        }
        self.local_a20 = self.local_a20.saturating_add(1);
        Ok(())
    }

    pub fn local_disable_a20(&mut self, mem: &mut PcMemory) -> XmsResult<()> {
        if self.local_a20 == 0 {
            return Err(XmsError::A20Error);
        }
        self.local_a20 -= 1;
        if self.local_a20 == 0 && !self.global_a20 {
            mem.set_a20(false);
        }
        Ok(())
    }

    /// Largest free block and total free memory, in KB.
    pub fn query_free(&self, mem: &PcMemory) -> XmsResult<(u32, u32)> {
        let pages = mem.pages();
        let largest = (pages.free_largest() * 4) as u32;
        let total = (pages.free_total() * 4) as u32;
        if total == 0 {
            return Err(XmsError::OutOfSpace);
        }
        Ok((largest, total))
    }

    pub fn allocate(&mut self, mem: &mut PcMemory, size_kb: u32) -> XmsResult<u16> {
        let index = (1..self.handles.len())
            .find(|&i| self.handles[i].is_none())
            .ok_or(XmsError::OutOfHandles)?;
        let block = if size_kb == 0 {
            // Zero-sized blocks own no memory; they report where the next page would be.
            XmsBlock {
                size_kb: 0,
                locks: 0,
                pages: None,
                placeholder: mem.pages().next_free_page().unwrap_or(0),
            }
        } else {
            let pages = size_kb.div_ceil(4) as usize;
            let handle = mem
                .pages_mut()
                .allocate_pages(pages, true)
                .ok_or(XmsError::OutOfSpace)?;
            if self.zero_on_alloc {
                mem.zero_chain(handle).map_err(|_| XmsError::DriverError)?;
            }
            XmsBlock {
                size_kb,
                locks: 0,
                pages: Some(handle),
                placeholder: 0,
            }
        };
        self.handles[index] = Some(block);
        debug!(handle = index, size_kb, "XMS allocate");
        Ok(index as u16)
    }

    pub fn free(&mut self, mem: &mut PcMemory, handle: u16) -> XmsResult<()> {
        let block = self.block_mut(handle)?;
        if block.locks > 0 {
            return Err(XmsError::BlockLocked);
        }
        if let Some(h) = block.pages {
            mem.pages_mut().release_pages(h);
        }
        self.handles[usize::from(handle)] = None;
        Ok(())
    }

    /// Returns the block's physical address. The count saturates at 255.
    pub fn lock(&mut self, handle: u16) -> XmsResult<u32> {
        let block = self.block_mut(handle)?;
        block.locks = block.locks.saturating_add(1);
        Ok(block.physical_address())
    }

    pub fn unlock(&mut self, handle: u16) -> XmsResult<()> {
        let block = self.block_mut(handle)?;
        if block.locks == 0 {
            return Err(XmsError::BlockNotLocked);
        }
        block.locks -= 1;
        Ok(())
    }

    pub fn handle_info(&self, handle: u16) -> XmsResult<HandleInfo> {
        let block = self.block(handle).ok_or(XmsError::InvalidHandle)?;
        Ok(HandleInfo {
            lock_count: block.locks,
            free_handles: self.free_handles(),
            size_kb: block.size_kb,
        })
    }

    pub fn resize(&mut self, mem: &mut PcMemory, handle: u16, size_kb: u32) -> XmsResult<()> {
        let block = self.block_mut(handle)?;
        if block.locks > 0 {
            return Err(XmsError::BlockLocked);
        }
        let pages = size_kb.div_ceil(4) as usize;
        let mut chain = block.pages;
        let fresh = chain.is_none();
        mem.reallocate_pages(&mut chain, pages, true)
            .map_err(|_| XmsError::DriverError)?
            .ok_or(XmsError::OutOfSpace)?;
        if fresh && self.zero_on_alloc {
            if let Some(h) = chain {
                mem.zero_chain(h).map_err(|_| XmsError::DriverError)?;
            }
        }
        let placeholder = mem.pages().next_free_page().unwrap_or(0);
        let block = self.block_mut(handle)?;
        block.pages = chain;
        block.size_kb = size_kb;
        if chain.is_none() {
            block.placeholder = placeholder;
        }
        Ok(())
    }

    /// AH=0Bh. The gate is forced on for the copy and put back afterwards.
    pub fn move_memory(&mut self, mem: &mut PcMemory, desc: &MoveDescriptor) -> XmsResult<()> {
        let len = desc.length;
        if len == 0 {
            return Ok(());
        }
        if len % 2 != 0 {
            return Err(XmsError::InvalidLength);
        }
        let src = self.endpoint(
            desc.src_handle,
            desc.src_offset,
            len,
            XmsError::InvalidSourceHandle,
            XmsError::InvalidSourceOffset,
        )?;
        let dst = self.endpoint(
            desc.dst_handle,
            desc.dst_offset,
            len,
            XmsError::InvalidDestHandle,
            XmsError::InvalidDestOffset,
        )?;
        for handle in [desc.src_handle, desc.dst_handle] {
            if self.block(handle).is_some_and(|b| b.locks > 0) {
                return Err(XmsError::BlockLocked);
            }
        }

        let a20 = mem.a20_enabled();
        mem.set_a20(true);
        let mut buf = vec![0u8; len as usize];
        let copied = match src {
            Endpoint::Linear(addr) => mem.try_read(addr, &mut buf),
            Endpoint::Physical(addr) => mem.phys_read(addr, &mut buf),
        }
        .and_then(|()| match dst {
            Endpoint::Linear(addr) => mem.try_write(addr, &buf),
            Endpoint::Physical(addr) => mem.phys_write(addr, &buf),
        });
        mem.set_a20(a20);
        copied.map_err(|_| XmsError::ParityError)
    }

    fn endpoint(
        &self,
        handle: u16,
        offset: u32,
        len: u32,
        bad_handle: XmsError,
        bad_offset: XmsError,
    ) -> XmsResult<Endpoint> {
        if handle == 0 {
            let addr = RealPtr::from_u32(offset).linear().raw();
            if u64::from(addr) + u64::from(len) > u64::from(REAL_MOVE_LIMIT) {
                return Err(XmsError::InvalidLength);
            }
            return Ok(Endpoint::Linear(addr));
        }
        let block = self.block(handle).ok_or(bad_handle)?;
        let size = u64::from(block.size_kb) * 1024;
        if u64::from(offset) >= size {
            return Err(bad_offset);
        }
        if u64::from(len) > size - u64::from(offset) {
            return Err(XmsError::InvalidLength);
        }
        Ok(Endpoint::Physical(
            u64::from(block.physical_address()) + u64::from(offset),
        ))
    }
}

/// Stores an XMS result: AX = 1 on success, otherwise BL holds the error. With `touch_bl`,
/// BL is cleared on success as well.
fn set_result(cpu: &mut CpuState, result: XmsResult<()>, touch_bl: bool) {
    match result {
        Ok(()) => {
            if touch_bl {
                cpu.set_bl(0);
            }
            cpu.set_ax(1);
        }
        Err(e) => {
            cpu.set_bl(e.code());
            cpu.set_ax(0);
        }
    }
}

/// Decodes one call through the XMS entry point.
///
/// Guest errors land in AX/BL; an `Err` means the DOS arena is beyond repair.
pub fn handle_xms_call(
    xms: &mut Xms,
    cpu: &mut CpuState,
    mem: &mut PcMemory,
    dos: &mut DosArena,
) -> Result<()> {
    let ah = cpu.ah();
    debug!(ah, dx = cpu.dx(), "XMS call");
    match ah {
        0x00 => {
            cpu.set_ax(XMS_VERSION);
            cpu.set_bx(XMS_DRIVER_VERSION);
            cpu.set_dx(u16::from(xms.hma_exists));
        }
        0x01 => {
            let r = xms.request_hma(cpu.dx());
            set_result(cpu, r, true);
        }
        0x02 => {
            let r = xms.release_hma();
            set_result(cpu, r, true);
        }
        0x03 => {
            let r = xms.global_enable_a20(mem);
            set_result(cpu, r, true);
        }
        0x04 => {
            let r = xms.global_disable_a20(mem);
            set_result(cpu, r, true);
        }
        0x05 => {
            let r = xms.local_enable_a20(mem);
            set_result(cpu, r, true);
        }
        0x06 => {
            let r = xms.local_disable_a20(mem);
            set_result(cpu, r, true);
        }
        0x07 => {
            cpu.set_ax(u16::from(mem.a20_enabled()));
            cpu.set_bl(0);
        }
        0x08 => {
            let (largest, total, code) = match xms.query_free(mem) {
                Ok((l, t)) => (l, t, 0),
                Err(e) => (0, 0, e.code()),
            };
            cpu.eax = (cpu.eax & 0xFFFF_0000) | largest.min(0xFFFF);
            cpu.edx = (cpu.edx & 0xFFFF_0000) | total.min(0xFFFF);
            cpu.set_bl(code);
        }
        0x88 => {
            let (largest, total, code) = match xms.query_free(mem) {
                Ok((l, t)) => (l, t, 0),
                Err(e) => (0, 0, e.code()),
            };
            cpu.eax = largest;
            cpu.edx = total;
            cpu.ecx = (mem.pages().total_pages() as u32)
                .wrapping_mul(PAGE_SIZE)
                .wrapping_sub(1);
            cpu.set_bl(code);
        }
        0x09 | 0x89 => {
            let size = if ah == 0x09 { u32::from(cpu.dx()) } else { cpu.edx };
            match xms.allocate(mem, size) {
                Ok(handle) => {
                    cpu.set_dx(handle);
                    set_result(cpu, Ok(()), true);
                }
                Err(e) => set_result(cpu, Err(e), true),
            }
        }
        0x0A => {
            let r = xms.free(mem, cpu.dx());
            set_result(cpu, r, true);
        }
        0x0B => {
            let addr = cpu.linear(SegReg::Ds, u32::from(cpu.si()));
            let desc = MoveDescriptor::read(mem, addr);
            let r = xms.move_memory(mem, &desc);
            set_result(cpu, r, false);
        }
        0x0C => match xms.lock(cpu.dx()) {
            Ok(address) => {
                cpu.set_ax(1);
                cpu.set_bx(address as u16);
                cpu.set_dx((address >> 16) as u16);
            }
            Err(e) => set_result(cpu, Err(e), false),
        },
        0x0D => {
            let r = xms.unlock(cpu.dx());
            set_result(cpu, r, true);
        }
        0x0E => match xms.handle_info(cpu.dx()) {
            Ok(info) => {
                cpu.set_bh(info.lock_count);
                cpu.set_bl(info.free_handles.min(0xFF) as u8);
                cpu.edx = info.size_kb & 0xFFFF;
                cpu.set_ax(1);
            }
            Err(e) => set_result(cpu, Err(e), false),
        },
        0x8E => match xms.handle_info(cpu.dx()) {
            Ok(info) => {
                cpu.set_bh(info.lock_count);
                cpu.set_cx(info.free_handles);
                cpu.edx = info.size_kb;
                cpu.set_ax(1);
            }
            Err(e) => set_result(cpu, Err(e), false),
        },
        0x0F | 0x8F => {
            let size = if ah == 0x0F { u32::from(cpu.bx()) } else { cpu.ebx };
            let r = xms.resize(mem, cpu.dx(), size);
            set_result(cpu, r, true);
        }
        0x10 => allocate_umb(xms, cpu, mem, dos)?,
        0x11 => {
            if !xms.umb_available {
                set_result(cpu, Err(XmsError::NotImplemented), true);
            } else if dos.umb_chain_start() != NO_UMB_CHAIN && dos.free(mem, cpu.dx()).is_ok() {
                cpu.set_ax(1);
            } else {
                cpu.set_ax(0);
                cpu.set_bl(XmsError::UmbNoBlocksAvailable.code());
            }
        }
        _ => {
            warn!("XMS: unknown function {ah:#04x}");
            set_result(cpu, Err(XmsError::NotImplemented), true);
        }
    }
    Ok(())
}

fn allocate_umb(
    xms: &Xms,
    cpu: &mut CpuState,
    mem: &mut PcMemory,
    dos: &mut DosArena,
) -> Result<()> {
    if !xms.umb_available {
        set_result(cpu, Err(XmsError::NotImplemented), true);
        return Ok(());
    }
    if dos.umb_chain_start() == NO_UMB_CHAIN {
        cpu.set_ax(0);
        cpu.set_bl(XmsError::UmbNoBlocksAvailable.code());
        cpu.set_dx(0);
        return Ok(());
    }
    let size = cpu.dx();
    let result = UmbLinkGuard::new(dos, mem).allocate(size)?;
    match result {
        Ok(segment) => {
            cpu.set_ax(1);
            cpu.set_bx(segment);
            cpu.set_dx(size);
        }
        Err(e) => {
            cpu.set_ax(0);
            let code = if e.available == 0 {
                XmsError::UmbNoBlocksAvailable
            } else {
                XmsError::UmbOnlySmallerBlock
            };
            cpu.set_bl(code.code());
            cpu.set_dx(e.available);
        }
    }
    Ok(())
}

impl Machine {
    pub(crate) fn xms_call(&mut self) -> Result<CallbackReturn> {
        match self.xms.as_mut() {
            Some(xms) => handle_xms_call(xms, &mut self.cpu, &mut self.mem, &mut self.dos)?,
            None => warn!("XMS entry called without a driver"),
        }
        Ok(CallbackReturn::Next)
    }

    /// INT 2Fh: AX=4300h installation check and AX=4310h entry point query.
    pub(crate) fn xms_multiplex(&mut self) -> Result<CallbackReturn> {
        let Some(entry) = self.xms.as_ref().and_then(Xms::entry_point) else {
            return Ok(CallbackReturn::Next);
        };
        match self.cpu.ax() {
            0x4300 => self.cpu.set_al(0x80),
            0x4310 => {
                self.cpu.set_real_seg(SegReg::Es, entry.segment);
                self.cpu.set_bx(entry.offset);
            }
            _ => {}
        }
        Ok(CallbackReturn::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalError;

    fn driver() -> (PcMemory, Xms) {
        let mem = PcMemory::new(4 * 1024 * 1024).unwrap();
        let xms = Xms::new(&MemoryConfig::default(), &mem);
        (mem, xms)
    }

    #[test]
    fn handle_zero_is_reserved() {
        let (mut mem, mut xms) = driver();
        assert_eq!(xms.free_handles(), 255);
        assert_eq!(xms.free(&mut mem, 0), Err(XmsError::InvalidHandle));
        assert_eq!(xms.lock(0), Err(XmsError::InvalidHandle));
        let h = xms.allocate(&mut mem, 64).unwrap();
        assert_eq!(h, 1);
    }

    #[test]
    fn zero_sized_block_owns_nothing() {
        let (mut mem, mut xms) = driver();
        let before = mem.pages().free_total();
        let h = xms.allocate(&mut mem, 0).unwrap();
        assert_eq!(mem.pages().free_total(), before);
        let info = xms.handle_info(h).unwrap();
        assert_eq!((info.size_kb, info.lock_count), (0, 0));
        assert_eq!(xms.lock(h).unwrap(), 0x110 * PAGE_SIZE);
        xms.unlock(h).unwrap();
        xms.free(&mut mem, h).unwrap();
        assert_eq!(mem.pages().free_total(), before);
    }

    #[test]
    fn locks_are_balanced() {
        let (mut mem, mut xms) = driver();
        let h = xms.allocate(&mut mem, 16).unwrap();
        let addr = xms.lock(h).unwrap();
        assert_eq!(xms.lock(h).unwrap(), addr);
        assert_eq!(xms.free(&mut mem, h), Err(XmsError::BlockLocked));
        assert_eq!(xms.resize(&mut mem, h, 32), Err(XmsError::BlockLocked));
        xms.unlock(h).unwrap();
        xms.unlock(h).unwrap();
        assert_eq!(xms.unlock(h), Err(XmsError::BlockNotLocked));
        xms.free(&mut mem, h).unwrap();
    }

    #[test]
    fn lock_count_saturates() {
        let (mut mem, mut xms) = driver();
        let h = xms.allocate(&mut mem, 4).unwrap();
        for _ in 0..300 {
            xms.lock(h).unwrap();
        }
        assert_eq!(xms.handle_info(h).unwrap().lock_count, 255);
    }

    #[test]
    fn running_out_of_handles() {
        let cfg = MemoryConfig {
            xms_handles: 3,
            ..MemoryConfig::default()
        };
        let mut mem = PcMemory::new(4 * 1024 * 1024).unwrap();
        let mut xms = Xms::new(&cfg, &mem);
        xms.allocate(&mut mem, 4).unwrap();
        xms.allocate(&mut mem, 4).unwrap();
        assert_eq!(xms.allocate(&mut mem, 4), Err(XmsError::OutOfHandles));
    }

    #[test]
    fn allocation_failure_leaves_the_table_alone() {
        let (mut mem, mut xms) = driver();
        let free = xms.free_handles();
        assert_eq!(xms.allocate(&mut mem, 64 * 1024), Err(XmsError::OutOfSpace));
        assert_eq!(xms.free_handles(), free);
    }

    #[test]
    fn local_disable_without_enable_is_an_a20_error() {
        let (mut mem, mut xms) = driver();
        mem.set_a20(false);
        assert_eq!(xms.local_disable_a20(&mut mem), Err(XmsError::A20Error));
        assert!(!mem.a20_enabled());
        assert_eq!(xms.local_a20_count(), 0);
    }

    #[test]
    fn global_disable_waits_for_local_enables() {
        let (mut mem, mut xms) = driver();
        mem.set_a20(false);
        xms.global_enable_a20(&mut mem).unwrap();
        xms.local_enable_a20(&mut mem).unwrap();
        assert_eq!(xms.global_disable_a20(&mut mem), Err(XmsError::A20StillEnabled));
        assert!(mem.a20_enabled());
        xms.local_disable_a20(&mut mem).unwrap();
        assert!(!mem.a20_enabled());
    }

    #[test]
    fn hma_is_first_come_first_served() {
        let cfg = MemoryConfig {
            hma_min_alloc: 0x1000,
            ..MemoryConfig::default()
        };
        let mem = PcMemory::new(4 * 1024 * 1024).unwrap();
        let mut xms = Xms::new(&cfg, &mem);
        assert_eq!(xms.request_hma(0x0800), Err(XmsError::HmaTooSmall));
        xms.request_hma(0xFFFF).unwrap();
        assert_eq!(xms.request_hma(0xFFFF), Err(XmsError::HmaInUse));
        xms.release_hma().unwrap();
        assert_eq!(xms.release_hma(), Err(XmsError::HmaNotAllocated));

        let cfg = MemoryConfig {
            dos_in_hma: true,
            ..MemoryConfig::default()
        };
        let mut xms = Xms::new(&cfg, &mem);
        assert_eq!(xms.request_hma(0xFFFF), Err(XmsError::HmaInUse));
    }

    #[test]
    fn move_validation_order() {
        let (mut mem, mut xms) = driver();
        let h = xms.allocate(&mut mem, 4).unwrap();
        let mut desc = MoveDescriptor {
            length: 0,
            src_handle: 9,
            src_offset: 0,
            dst_handle: h,
            dst_offset: 0,
        };
        assert_eq!(xms.move_memory(&mut mem, &desc), Ok(()));
        desc.length = 3;
        assert_eq!(xms.move_memory(&mut mem, &desc), Err(XmsError::InvalidLength));
        desc.length = 2;
        assert_eq!(xms.move_memory(&mut mem, &desc), Err(XmsError::InvalidSourceHandle));
        desc.src_handle = h;
        desc.src_offset = 4096;
        assert_eq!(xms.move_memory(&mut mem, &desc), Err(XmsError::InvalidSourceOffset));
        desc.src_offset = 4094;
        desc.length = 4;
        assert_eq!(xms.move_memory(&mut mem, &desc), Err(XmsError::InvalidLength));
        desc.length = 2;
        desc.dst_offset = 5000;
        assert_eq!(xms.move_memory(&mut mem, &desc), Err(XmsError::InvalidDestOffset));
        desc.dst_handle = 0;
        desc.dst_offset = RealPtr::new(0xFFFF, 0xFFFF).to_u32();
        assert_eq!(xms.move_memory(&mut mem, &desc), Err(XmsError::InvalidLength));
    }

    #[test]
    fn move_between_conventional_memory_and_a_block() {
        let (mut mem, mut xms) = driver();
        let h = xms.allocate(&mut mem, 8).unwrap();
        mem.write_bytes(0x2000, b"extended");
        mem.set_a20(false);
        let to_block = MoveDescriptor {
            length: 8,
            src_handle: 0,
            src_offset: RealPtr::new(0x0200, 0).to_u32(),
            dst_handle: h,
            dst_offset: 4100,
        };
        xms.move_memory(&mut mem, &to_block).unwrap();
        assert!(!mem.a20_enabled());

        let base = u64::from(xms.block(h).unwrap().physical_address());
        let mut buf = [0u8; 8];
        mem.phys_read(base + 4100, &mut buf).unwrap();
        assert_eq!(&buf, b"extended");

        let back = MoveDescriptor {
            length: 8,
            src_handle: h,
            src_offset: 4100,
            dst_handle: 0,
            dst_offset: RealPtr::new(0x0300, 4).to_u32(),
        };
        xms.move_memory(&mut mem, &back).unwrap();
        let mut buf = [0u8; 8];
        mem.read_bytes(0x3004, &mut buf);
        assert_eq!(&buf, b"extended");
    }

    #[test]
    fn resize_keeps_contents() {
        let (mut mem, mut xms) = driver();
        let h = xms.allocate(&mut mem, 4).unwrap();
        let blocker = xms.allocate(&mut mem, 4).unwrap();
        let base = u64::from(xms.block(h).unwrap().physical_address());
        mem.phys_write(base, b"keep").unwrap();
        xms.resize(&mut mem, h, 64).unwrap();
        let block = xms.block(h).unwrap();
        assert_eq!(block.size_kb, 64);
        assert_eq!(mem.pages().allocated_pages(block.pages().unwrap()), 16);
        let mut buf = [0u8; 4];
        mem.phys_read(u64::from(block.physical_address()), &mut buf).unwrap();
        assert_eq!(&buf, b"keep");
        xms.free(&mut mem, blocker).unwrap();
        xms.resize(&mut mem, h, 0).unwrap();
        assert_eq!(xms.handle_info(h).unwrap().size_kb, 0);
    }

    #[test]
    fn corrupt_umb_chain_aborts_the_call() {
        let (mut mem, mut xms) = driver();
        let mut cpu = CpuState::default();
        let mut callbacks = CallbackTable::new(&mut mem).unwrap();
        let mut dos = DosArena::setup(&mut mem, &mut callbacks).unwrap();
        dos.build_umb_chain(&mut mem, true, 0xD000, 0xDFFF).unwrap();
        xms.umb_available = true;
        mem.write_u8(0xD0000, b'X');

        cpu.set_ah(0x10);
        cpu.set_dx(0x10);
        assert!(matches!(
            handle_xms_call(&mut xms, &mut cpu, &mut mem, &mut dos),
            Err(FatalError::McbChainCorrupted {
                segment: 0xD000,
                kind: b'X'
            })
        ));
    }

    #[test]
    fn register_interface_reports_errors_in_bl() {
        let (mut mem, mut xms) = driver();
        let mut cpu = CpuState::default();
        let mut callbacks = CallbackTable::new(&mut mem).unwrap();
        let mut dos = DosArena::setup(&mut mem, &mut callbacks).unwrap();

        cpu.set_ah(0x09);
        cpu.set_dx(32);
        cpu.set_bl(0x55);
        handle_xms_call(&mut xms, &mut cpu, &mut mem, &mut dos).unwrap();
        assert_eq!(cpu.ax(), 1);
        assert_eq!(cpu.bl(), 0);
        let handle = cpu.dx();

        cpu.set_ah(0x0D);
        cpu.set_dx(handle);
        handle_xms_call(&mut xms, &mut cpu, &mut mem, &mut dos).unwrap();
        assert_eq!((cpu.ax(), cpu.bl()), (0, 0xAA));

        cpu.set_ah(0x0E);
        cpu.set_dx(handle);
        handle_xms_call(&mut xms, &mut cpu, &mut mem, &mut dos).unwrap();
        assert_eq!(cpu.ax(), 1);
        assert_eq!(cpu.bh(), 0);
        assert_eq!(cpu.bl(), 254);
        assert_eq!(cpu.dx(), 32);

        cpu.set_ah(0x08);
        handle_xms_call(&mut xms, &mut cpu, &mut mem, &mut dos).unwrap();
        assert_eq!(cpu.bl(), 0);
        assert_eq!(cpu.ax(), cpu.dx());

        cpu.set_ah(0x42);
        handle_xms_call(&mut xms, &mut cpu, &mut mem, &mut dos).unwrap();
        assert_eq!((cpu.ax(), cpu.bl()), (0, 0x80));
    }
}

use crate::alloc::{MemHandle, PageAllocator, Reallocation, PAGE_SIZE};
use crate::linear::LinearMap;
use crate::phys::{DenseMemory, GuestMemory, GuestMemoryResult};
use crate::MemoryBus;

/// Guest RAM together with its page allocator and first-megabyte page map.
///
/// `phys_*` accessors address RAM directly; `try_read`/`try_write` and the [`MemoryBus`] impl
/// take linear addresses and translate them page by page.
#[derive(Debug, Clone)]
pub struct PcMemory {
    ram: DenseMemory,
    pages: PageAllocator,
    map: LinearMap,
}

impl PcMemory {
    pub fn new(size_bytes: u64) -> GuestMemoryResult<Self> {
        let ram = DenseMemory::new(size_bytes)?;
        let total_pages = (size_bytes / u64::from(PAGE_SIZE)) as usize;
        Ok(Self {
            ram,
            pages: PageAllocator::new(total_pages),
            map: LinearMap::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.ram.size()
    }

    pub fn ram(&self) -> &DenseMemory {
        &self.ram
    }

    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut PageAllocator {
        &mut self.pages
    }

    pub fn linear_map(&self) -> &LinearMap {
        &self.map
    }

    pub fn linear_map_mut(&mut self) -> &mut LinearMap {
        &mut self.map
    }

    pub fn a20_enabled(&self) -> bool {
        self.map.a20_enabled()
    }

    pub fn set_a20(&mut self, enabled: bool) {
        self.map.set_a20(enabled);
    }

    pub fn map_page(&mut self, linear_page: u32, phys_page: u32) -> bool {
        self.map.map_page(linear_page, phys_page)
    }

    pub fn clear_tlb(&mut self) {
        self.map.clear_tlb();
    }

    pub fn translate(&self, linear: u32) -> u64 {
        self.map.translate(linear)
    }

    pub fn phys_read(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        self.ram.read_into(paddr, dst)
    }

    pub fn phys_write(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        self.ram.write_from(paddr, src)
    }

    pub fn phys_copy(&mut self, dst: u64, src: u64, len: usize) -> GuestMemoryResult<()> {
        self.ram.copy_within(src, dst, len)
    }

    /// Linear read, split at page boundaries so every page is translated on its own.
    pub fn try_read(&self, linear: u32, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let mut done = 0usize;
        while done < dst.len() {
            let addr = linear.wrapping_add(done as u32);
            let in_page = (PAGE_SIZE - (addr & 0xFFF)) as usize;
            let n = in_page.min(dst.len() - done);
            self.ram
                .read_into(self.map.translate(addr), &mut dst[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    pub fn try_write(&mut self, linear: u32, src: &[u8]) -> GuestMemoryResult<()> {
        let mut done = 0usize;
        while done < src.len() {
            let addr = linear.wrapping_add(done as u32);
            let in_page = (PAGE_SIZE - (addr & 0xFFF)) as usize;
            let n = in_page.min(src.len() - done);
            let paddr = self.map.translate(addr);
            self.ram.write_from(paddr, &src[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Copies `len` bytes between linear addresses with memmove semantics.
    pub fn block_copy(&mut self, dst: u32, src: u32, len: usize) -> GuestMemoryResult<()> {
        let mut buf = vec![0u8; len];
        self.try_read(src, &mut buf)?;
        self.try_write(dst, &buf)
    }

    /// Zero-fills every page of a chain.
    pub fn zero_chain(&mut self, handle: MemHandle) -> GuestMemoryResult<()> {
        let chain: Vec<u32> = self.pages.chain(handle).collect();
        for page in chain {
            self.ram
                .fill(u64::from(page) * u64::from(PAGE_SIZE), PAGE_SIZE as usize, 0)?;
        }
        Ok(())
    }

    /// [`PageAllocator::reallocate_pages`] that also carries the contents along when the chain
    /// has to move.
    pub fn reallocate_pages(
        &mut self,
        handle: &mut Option<MemHandle>,
        pages: usize,
        sequence: bool,
    ) -> GuestMemoryResult<Option<Reallocation>> {
        let result = self.pages.reallocate_pages(handle, pages, sequence);
        if let (Some(Reallocation::Moved { from, pages: old }), Some(to)) = (result, *handle) {
            self.ram.copy_within(
                u64::from(from.base()),
                u64::from(to.base()),
                old * PAGE_SIZE as usize,
            )?;
        }
        Ok(result)
    }
}

impl MemoryBus for PcMemory {
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let paddr = self.map.translate(addr.wrapping_add(i as u32));
            *byte = self.ram.read_byte(paddr).unwrap_or(0xFF);
        }
    }

    fn write_bytes(&mut self, addr: u32, buf: &[u8]) {
        if self.try_write(addr, buf).is_ok() {
            return;
        }
        // Partially out of range: fall back to byte writes and drop the ones that miss RAM.
        for (i, &byte) in buf.iter().enumerate() {
            let paddr = self.map.translate(addr.wrapping_add(i as u32));
            let _ = self.ram.write_byte(paddr, byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_bus_reads_outside_ram() {
        let mut mem = PcMemory::new(2 * 1024 * 1024).unwrap();
        assert_eq!(mem.read_u32(0x30_0000), 0xFFFF_FFFF);
        mem.write_u8(0x30_0000, 0x12);
        assert_eq!(mem.read_u8(0x30_0000), 0xFF);
    }

    #[test]
    fn linear_access_follows_the_page_map() {
        let mut mem = PcMemory::new(2 * 1024 * 1024).unwrap();
        mem.map_page(0xE0, 0x120);
        mem.write_u16(0xE0FFF, 0xBEEF);
        let mut phys = [0u8; 1];
        mem.phys_read(0x12_0FFF, &mut phys).unwrap();
        assert_eq!(phys[0], 0xEF);
        // Second byte lands in the next linear page, which is still identity mapped.
        mem.phys_read(0xE1000, &mut phys).unwrap();
        assert_eq!(phys[0], 0xBE);
    }

    #[test]
    fn moved_chain_keeps_its_contents() {
        let mut mem = PcMemory::new(2 * 1024 * 1024).unwrap();
        let mut h = mem.pages_mut().allocate_pages(1, true);
        let old = h.unwrap();
        mem.phys_write(u64::from(old.base()), b"payload").unwrap();
        let _blocker = mem.pages_mut().allocate_pages(1, true).unwrap();

        let r = mem.reallocate_pages(&mut h, 3, true).unwrap();
        assert!(matches!(r, Some(Reallocation::Moved { .. })));
        let mut buf = [0u8; 7];
        mem.phys_read(u64::from(h.unwrap().base()), &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }
}

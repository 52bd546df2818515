//! INT 67h AH=57h: move or exchange a memory region between conventional and expanded memory.

use memory::{MemoryBus, PcMemory, PAGE_SIZE};

use super::{Ems, EmmResult, EMM_PAGE_SIZE};
use crate::error::{EmmError, Result};

/// One side of a region descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionEnd {
    /// 0 = conventional, 1 = expanded.
    pub kind: u8,
    pub handle: u16,
    pub offset: u16,
    /// Logical page for expanded memory, segment for conventional memory.
    pub page_seg: u16,
}

impl RegionEnd {
    pub fn is_expanded(&self) -> bool {
        self.kind != 0
    }

    /// Byte offset of the region inside its handle.
    fn handle_offset(&self) -> u32 {
        u32::from(self.page_seg) * EMM_PAGE_SIZE + u32::from(self.offset)
    }

    fn read<B: MemoryBus + ?Sized>(bus: &mut B, at: u32) -> Self {
        Self {
            kind: bus.read_u8(at),
            handle: bus.read_u16(at + 1),
            offset: bus.read_u16(at + 3),
            page_seg: bus.read_u16(at + 5),
        }
    }
}

/// The 0x12-byte descriptor at DS:SI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveRegion {
    pub length: u32,
    pub src: RegionEnd,
    pub dst: RegionEnd,
}

impl MoveRegion {
    pub const SIZE: u32 = 0x12;

    pub fn read<B: MemoryBus + ?Sized>(bus: &mut B, at: u32) -> Self {
        Self {
            length: bus.read_u32(at),
            src: RegionEnd::read(bus, at + 4),
            dst: RegionEnd::read(bus, at + 0x0B),
        }
    }

    /// Both ends are in the same handle and their byte ranges intersect.
    pub fn overlaps(&self) -> bool {
        if !(self.src.is_expanded() && self.dst.is_expanded()) || self.src.handle != self.dst.handle {
            return false;
        }
        let (s, d) = (
            u64::from(self.src.handle_offset()),
            u64::from(self.dst.handle_offset()),
        );
        let len = u64::from(self.length);
        s < d + len && d < s + len
    }
}

/// Largest region a single call may move.
const MAX_REGION: u32 = 0x10_0000;

/// Where the bytes of one end live.
enum Span {
    /// Linear address in the first megabyte.
    Conventional(u32),
    /// Allocator pages covering the range, and the offset into the first one.
    Expanded { pages: Vec<u32>, first: u32 },
}

impl Span {
    fn resolve(ems: &Ems, mem: &PcMemory, end: &RegionEnd, length: u32) -> EmmResult<Self> {
        if !end.is_expanded() {
            let addr = u32::from(end.page_seg) * 16 + u32::from(end.offset);
            if u64::from(addr) + u64::from(length) > u64::from(MAX_REGION) {
                return Err(EmmError::ConventionalWrap);
            }
            return Ok(Span::Conventional(addr));
        }
        let handle = ems.handle(end.handle).ok_or(EmmError::InvalidHandle)?;
        let start = end.handle_offset();
        let size = u64::from(handle.pages) * u64::from(EMM_PAGE_SIZE);
        if size < u64::from(start) + u64::from(length) {
            return Err(EmmError::LogicalOutOfRange);
        }
        let Some(chain) = handle.memory() else {
            return Ok(Span::Expanded {
                pages: Vec::new(),
                first: 0,
            });
        };
        let first = start % PAGE_SIZE;
        let count = (first + length).div_ceil(PAGE_SIZE) as usize;
        let pages: Vec<u32> = mem
            .pages()
            .chain(chain)
            .skip((start / PAGE_SIZE) as usize)
            .take(count)
            .collect();
        if pages.len() != count {
            return Err(EmmError::SoftwareMalfunction);
        }
        Ok(Span::Expanded { pages, first })
    }

    /// Calls `f` with the physical address and length of every piece of `len` bytes at byte
    /// `at` of an expanded span.
    fn pieces(
        pages: &[u32],
        first: u32,
        at: u32,
        len: usize,
        mut f: impl FnMut(u64, usize, usize) -> Result<()>,
    ) -> Result<()> {
        let pos = first + at;
        let mut index = (pos / PAGE_SIZE) as usize;
        let mut off = pos % PAGE_SIZE;
        let mut done = 0usize;
        while done < len {
            let Some(&page) = pages.get(index) else { break };
            let n = ((PAGE_SIZE - off) as usize).min(len - done);
            f(u64::from(page) * u64::from(PAGE_SIZE) + u64::from(off), done, n)?;
            done += n;
            index += 1;
            off = 0;
        }
        Ok(())
    }

    fn read_at(&self, mem: &mut PcMemory, at: u32, buf: &mut [u8]) -> Result<()> {
        match self {
            Span::Conventional(addr) => mem.read_bytes(addr + at, buf),
            Span::Expanded { pages, first } => {
                let len = buf.len();
                Self::pieces(pages, *first, at, len, |paddr, done, n| {
                    Ok(mem.phys_read(paddr, &mut buf[done..done + n])?)
                })?;
            }
        }
        Ok(())
    }

    fn write_at(&self, mem: &mut PcMemory, at: u32, buf: &[u8]) -> Result<()> {
        match self {
            Span::Conventional(addr) => mem.write_bytes(addr + at, buf),
            Span::Expanded { pages, first } => {
                Self::pieces(pages, *first, at, buf.len(), |paddr, done, n| {
                    Ok(mem.phys_write(paddr, &buf[done..done + n])?)
                })?;
            }
        }
        Ok(())
    }
}

impl Ems {
    /// Moves (`exchange == false`) or swaps the region described by `region`, one 4 KiB chunk
    /// at a time.
    ///
    /// An overlapping move within one handle behaves like `memmove` and is reported as
    /// [`EmmError::MoveOverlap`]; an overlapping exchange is refused.
    pub fn move_region(
        &self,
        mem: &mut PcMemory,
        region: &MoveRegion,
        exchange: bool,
    ) -> Result<EmmResult<()>> {
        if region.length > MAX_REGION {
            return Ok(Err(EmmError::RegionTooLong));
        }
        let src = match Span::resolve(self, mem, &region.src, region.length) {
            Ok(span) => span,
            Err(e) => return Ok(Err(e)),
        };
        let dst = match Span::resolve(self, mem, &region.dst, region.length) {
            Ok(span) => span,
            Err(e) => return Ok(Err(e)),
        };
        let overlap = region.overlaps();
        if overlap && exchange {
            return Ok(Err(EmmError::ExchangeOverlap));
        }

        // Copying towards higher offsets inside one handle has to start at the end.
        let backward = overlap && region.dst.handle_offset() > region.src.handle_offset();
        let chunks = region.length.div_ceil(PAGE_SIZE);
        let mut from = [0u8; PAGE_SIZE as usize];
        let mut to = [0u8; PAGE_SIZE as usize];
        for i in 0..chunks {
            let chunk = if backward { chunks - 1 - i } else { i };
            let at = chunk * PAGE_SIZE;
            let n = (region.length - at).min(PAGE_SIZE) as usize;
            src.read_at(mem, at, &mut from[..n])?;
            if exchange {
                dst.read_at(mem, at, &mut to[..n])?;
                src.write_at(mem, at, &to[..n])?;
            }
            dst.write_at(mem, at, &from[..n])?;
        }

        Ok(if overlap {
            Err(EmmError::MoveOverlap)
        } else {
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    fn setup() -> (PcMemory, Ems, u16) {
        let mut mem = PcMemory::new(4 * 1024 * 1024).unwrap();
        let mut ems = Ems::new(&MemoryConfig::default());
        let h = ems.allocate(&mut mem, 2, false).unwrap().unwrap();
        (mem, ems, h)
    }

    fn expanded(handle: u16, page: u16, offset: u16) -> RegionEnd {
        RegionEnd {
            kind: 1,
            handle,
            offset,
            page_seg: page,
        }
    }

    fn conventional(seg: u16, offset: u16) -> RegionEnd {
        RegionEnd {
            kind: 0,
            handle: 0,
            offset,
            page_seg: seg,
        }
    }

    #[test]
    fn conventional_to_expanded_and_back_across_pages() {
        let (mut mem, ems, h) = setup();
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        mem.write_bytes(0x20000, &data);

        let to_ems = MoveRegion {
            length: 6000,
            src: conventional(0x2000, 0),
            dst: expanded(h, 0, 0x3F00),
        };
        ems.move_region(&mut mem, &to_ems, false).unwrap().unwrap();

        let back = MoveRegion {
            length: 6000,
            src: expanded(h, 0, 0x3F00),
            dst: conventional(0x3000, 0),
        };
        ems.move_region(&mut mem, &back, false).unwrap().unwrap();
        let mut out = vec![0u8; 6000];
        mem.read_bytes(0x30000, &mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn exchange_swaps_both_sides() {
        let (mut mem, ems, h) = setup();
        mem.write_bytes(0x20000, b"left");
        mem.write_bytes(0x21000, b"rite");
        let put = MoveRegion {
            length: 4,
            src: conventional(0x2100, 0),
            dst: expanded(h, 1, 0),
        };
        ems.move_region(&mut mem, &put, false).unwrap().unwrap();

        let swap = MoveRegion {
            length: 4,
            src: conventional(0x2000, 0),
            dst: expanded(h, 1, 0),
        };
        ems.move_region(&mut mem, &swap, true).unwrap().unwrap();
        let mut buf = [0u8; 4];
        mem.read_bytes(0x20000, &mut buf);
        assert_eq!(&buf, b"rite");
    }

    #[test]
    fn bounds_and_handles_are_checked() {
        let (mut mem, ems, h) = setup();
        let past_end = MoveRegion {
            length: 0x10,
            src: expanded(h, 1, 0x3FF8),
            dst: conventional(0x2000, 0),
        };
        assert_eq!(
            ems.move_region(&mut mem, &past_end, false).unwrap(),
            Err(EmmError::LogicalOutOfRange)
        );
        let bad_handle = MoveRegion {
            length: 1,
            src: conventional(0x2000, 0),
            dst: expanded(55, 0, 0),
        };
        assert_eq!(
            ems.move_region(&mut mem, &bad_handle, false).unwrap(),
            Err(EmmError::InvalidHandle)
        );
    }

    #[test]
    fn overlapping_regions_in_one_handle() {
        let (mut mem, ems, h) = setup();
        mem.write_bytes(0x20000, b"abcdefgh");
        let put = MoveRegion {
            length: 8,
            src: conventional(0x2000, 0),
            dst: expanded(h, 0, 0),
        };
        ems.move_region(&mut mem, &put, false).unwrap().unwrap();

        let shift = MoveRegion {
            length: 6,
            src: expanded(h, 0, 0),
            dst: expanded(h, 0, 2),
        };
        assert!(shift.overlaps());
        assert_eq!(
            ems.move_region(&mut mem, &shift, true).unwrap(),
            Err(EmmError::ExchangeOverlap)
        );
        assert_eq!(
            ems.move_region(&mut mem, &shift, false).unwrap(),
            Err(EmmError::MoveOverlap)
        );

        let get = MoveRegion {
            length: 8,
            src: expanded(h, 0, 0),
            dst: conventional(0x2000, 0),
        };
        ems.move_region(&mut mem, &get, false).unwrap().unwrap();
        let mut buf = [0u8; 8];
        mem.read_bytes(0x20000, &mut buf);
        assert_eq!(&buf, b"ababcdef");
    }

    #[test]
    fn oversized_and_wrapping_regions_are_refused() {
        let (mut mem, ems, h) = setup();
        let huge = MoveRegion {
            length: 0xFFFF_FFF0,
            src: expanded(h, 0, 0x10),
            dst: conventional(0x2000, 0),
        };
        assert_eq!(
            ems.move_region(&mut mem, &huge, false).unwrap(),
            Err(EmmError::RegionTooLong)
        );

        let wraps = MoveRegion {
            length: 0x20,
            src: conventional(0xFFFF, 0x0000),
            dst: expanded(h, 0, 0),
        };
        assert_eq!(
            ems.move_region(&mut mem, &wraps, false).unwrap(),
            Err(EmmError::ConventionalWrap)
        );

        let far_page = MoveRegion {
            length: MAX_REGION,
            src: expanded(h, 0xFFFF, 0xFFFF),
            dst: conventional(0, 0),
        };
        assert_eq!(
            ems.move_region(&mut mem, &far_page, false).unwrap(),
            Err(EmmError::LogicalOutOfRange)
        );
    }

    #[test]
    fn overlapping_move_spanning_several_chunks() {
        let (mut mem, ems, h) = setup();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        mem.write_bytes(0x20000, &data);
        let put = MoveRegion {
            length: 10_000,
            src: conventional(0x2000, 0),
            dst: expanded(h, 0, 0),
        };
        ems.move_region(&mut mem, &put, false).unwrap().unwrap();

        let shift = MoveRegion {
            length: 10_000,
            src: expanded(h, 0, 0),
            dst: expanded(h, 0, 100),
        };
        assert_eq!(
            ems.move_region(&mut mem, &shift, false).unwrap(),
            Err(EmmError::MoveOverlap)
        );

        let get = MoveRegion {
            length: 10_000,
            src: expanded(h, 0, 100),
            dst: conventional(0x4000, 0),
        };
        ems.move_region(&mut mem, &get, false).unwrap().unwrap();
        let mut out = vec![0u8; 10_000];
        mem.read_bytes(0x40000, &mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn descriptor_layout() {
        let mut mem = PcMemory::new(2 * 1024 * 1024).unwrap();
        mem.write_bytes(
            0x500,
            &[
                0x00, 0x10, 0x00, 0x00, // length
                0x00, 0x00, 0x00, 0x34, 0x12, 0x00, 0x20, // conventional 2000:1234
                0x01, 0x05, 0x00, 0x10, 0x00, 0x02, 0x00, // handle 5 page 2 offset 10h
            ],
        );
        let region = MoveRegion::read(&mut mem, 0x500);
        assert_eq!(region.length, 0x1000);
        assert_eq!(region.src, conventional(0x2000, 0x1234));
        assert_eq!(region.dst, expanded(5, 2, 0x10));
    }
}

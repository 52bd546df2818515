//! The DOS memory arena: a chain of memory control blocks (MCBs) stored in guest memory.
//!
//! Every MCB is one paragraph in front of the block it describes:
//!
//! ```text
//! +0  type   'M' more blocks follow, 'Z' last block
//! +1  owner  PSP segment (0 = free, 8 = DOS)
//! +3  size   paragraphs, not counting the MCB itself
//! +8  name   8 bytes, space padded
//! ```
//!
//! The low chain starts at [`DOS_MEM_START`]. When UMBs are enabled a second chain lives in upper
//! memory; a system "SC" block bridges the end of conventional memory to it, and linking the
//! UMBs simply flips the last low block from 'Z' to 'M'.

use memory::{MemoryBus, PcMemory};
use tracing::{debug, error, warn};

use crate::callback::{real_set_vec, CallbackTable, Handler};
use crate::error::{DosError, FatalError, Result};

pub const DOS_MEM_START: u16 = 0x158;
/// Bump-allocated area for driver tables and stubs (`DOS_GetMemory`).
pub const DOS_PRIVATE_SEGMENT: u16 = 0xC800;
pub const DOS_PRIVATE_SEGMENT_END: u16 = 0xD000;
/// Segment of the system MCB that starts the UMB chain.
pub const UMB_START_SEG: u16 = 0x9FFF;
/// "No UMB chain" marker for the chain start.
pub const NO_UMB_CHAIN: u16 = 0xFFFF;

pub const MCB_FREE: u16 = 0x0000;
pub const MCB_DOS: u16 = 0x0008;

const MCB_MORE: u8 = b'M';
const MCB_LAST: u8 = b'Z';

const COMPRESS_LIMIT: u32 = 10_000_000;

/// Where the "DOS default int" stub lives (0070:0008).
const DEFAULT_INT_SEG: u16 = 0x0070;
const DEFAULT_INT_OFS: u16 = 0x0008;

/// Smallest conventional memory the arena can be built in (192 KiB, in paragraphs).
const MIN_CONVENTIONAL_PARAS: u32 = 0x3000;

/// View of the MCB at a given segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mcb(pub u16);

impl Mcb {
    pub fn kind(self, mem: &mut PcMemory) -> u8 {
        mem.real_read_u8(self.0, 0)
    }

    pub fn set_kind(self, mem: &mut PcMemory, kind: u8) {
        mem.real_write_u8(self.0, 0, kind);
    }

    pub fn owner(self, mem: &mut PcMemory) -> u16 {
        mem.real_read_u16(self.0, 1)
    }

    pub fn set_owner(self, mem: &mut PcMemory, psp: u16) {
        mem.real_write_u16(self.0, 1, psp);
    }

    pub fn size(self, mem: &mut PcMemory) -> u16 {
        mem.real_read_u16(self.0, 3)
    }

    pub fn set_size(self, mem: &mut PcMemory, size: u16) {
        mem.real_write_u16(self.0, 3, size);
    }

    pub fn name(self, mem: &mut PcMemory) -> [u8; 8] {
        let mut name = [0u8; 8];
        mem.read_bytes(memory::RealPtr::new(self.0, 8).linear().raw(), &mut name);
        name
    }

    pub fn set_name(self, mem: &mut PcMemory, name: &[u8; 8]) {
        mem.write_bytes(memory::RealPtr::new(self.0, 8).linear().raw(), name);
    }

    fn is_valid(self, mem: &mut PcMemory) -> bool {
        matches!(self.kind(mem), MCB_MORE | MCB_LAST)
    }

    /// MCB directly after this block.
    pub fn next(self, mem: &mut PcMemory) -> Mcb {
        Mcb(self.0.wrapping_add(self.size(mem)).wrapping_add(1))
    }
}

/// A failed allocate or resize: the DOS error and the largest size that would have worked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeError {
    pub error: DosError,
    pub available: u16,
}

pub type DosResult<T> = std::result::Result<T, SizeError>;

fn corrupted(mem: &mut PcMemory, mcb: Mcb) -> FatalError {
    let kind = mcb.kind(mem);
    error!(segment = mcb.0, kind, "corrupt MCB chain");
    FatalError::McbChainCorrupted {
        segment: mcb.0,
        kind,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DosArena {
    first_mcb: u16,
    umb_start: u16,
    umb_linked: bool,
    strategy: u8,
    psp: u16,
    private_next: u16,
    default_int: u16,
}

impl DosArena {
    /// Builds the initial low-memory chain and claims IVT entries 1-4 for the DOS default
    /// interrupt stub.
    pub fn setup(mem: &mut PcMemory, callbacks: &mut CallbackTable) -> Result<Self> {
        let paras = (mem.size() / 16).min(0xA000) as u32;
        if paras < MIN_CONVENTIONAL_PARAS {
            error!(paras, "not enough conventional memory for DOS");
            return Err(FatalError::AllocationFailure(
                "less than 192 KiB of conventional memory",
            ));
        }

        let default_int = callbacks.allocate()?;
        callbacks.set_handler(default_int, Handler::DosDefault, "DOS default int");
        let [lo, hi] = default_int.to_le_bytes();
        let stub = memory::RealPtr::new(DEFAULT_INT_SEG, DEFAULT_INT_OFS);
        mem.write_bytes(stub.linear().raw(), &[0xFE, 0x38, lo, hi, 0xCF]);
        for vector in 1..=4 {
            real_set_vec(mem, vector, stub);
        }

        // Device driver placeholder, owned by DOS.
        let devices = Mcb(DOS_MEM_START);
        devices.set_owner(mem, MCB_DOS);
        devices.set_size(mem, 1);
        devices.set_kind(mem, MCB_MORE);

        // Small free block, as left behind by a grown environment.
        let mut used = 2u16;
        let env = Mcb(DOS_MEM_START + used);
        env.set_owner(mem, MCB_FREE);
        env.set_size(mem, 4);
        env.set_kind(mem, MCB_MORE);
        used += 5;

        // Locks the free block above so programs do not land at the very bottom.
        let lock = Mcb(DOS_MEM_START + used);
        lock.set_owner(mem, 0x40);
        lock.set_size(mem, 16);
        lock.set_kind(mem, MCB_MORE);
        used += 17;

        // The last paragraph below 640K is reserved for the UMB link MCB.
        let rest = Mcb(DOS_MEM_START + used);
        rest.set_owner(mem, MCB_FREE);
        rest.set_kind(mem, MCB_LAST);
        rest.set_size(mem, (paras as u16) - 2 - DOS_MEM_START - used);

        Ok(Self {
            first_mcb: DOS_MEM_START,
            umb_start: NO_UMB_CHAIN,
            umb_linked: false,
            strategy: 0,
            psp: MCB_DOS,
            private_next: DOS_PRIVATE_SEGMENT,
            default_int,
        })
    }

    pub fn first_mcb(&self) -> u16 {
        self.first_mcb
    }

    pub fn umb_chain_start(&self) -> u16 {
        self.umb_start
    }

    pub fn umbs_linked(&self) -> bool {
        self.umb_linked
    }

    pub fn psp(&self) -> u16 {
        self.psp
    }

    /// The PSP of the running program, maintained by the INT 21h dispatcher.
    pub fn set_psp(&mut self, psp: u16) {
        self.psp = psp;
    }

    pub fn strategy(&self) -> u8 {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: u8) -> bool {
        if (strategy & 0x3F) < 3 {
            self.strategy = strategy;
            true
        } else {
            false
        }
    }

    pub fn default_int_callback(&self) -> u16 {
        self.default_int
    }

    /// Hands out `paragraphs` from the private table area. Running out is fatal.
    pub fn get_memory(&mut self, paragraphs: u16) -> Result<u16> {
        if u32::from(paragraphs) + u32::from(self.private_next)
            >= u32::from(DOS_PRIVATE_SEGMENT_END)
        {
            error!(paragraphs, "not enough memory for internal tables");
            return Err(FatalError::PrivateAreaExhausted);
        }
        let seg = self.private_next;
        self.private_next += paragraphs;
        Ok(seg)
    }

    /// Merges runs of adjacent free blocks, starting at `from` (the first MCB by default).
    /// Returns the number of merges.
    pub fn compress(&mut self, mem: &mut PcMemory, from: Option<u16>) -> Result<u32> {
        let mut mcb = Mcb(from.unwrap_or(self.first_mcb));
        if !mcb.is_valid(mem) {
            return Err(corrupted(mem, mcb));
        }
        let mut merges = 0u32;
        let mut counter = 0u32;
        while mcb.kind(mem) != MCB_LAST {
            counter += 1;
            if counter > COMPRESS_LIMIT {
                return Err(corrupted(mem, mcb));
            }
            let next = mcb.next(mem);
            if !next.is_valid(mem) {
                return Err(corrupted(mem, next));
            }
            if mcb.owner(mem) == MCB_FREE && next.owner(mem) == MCB_FREE {
                let size = mcb
                    .size(mem)
                    .checked_add(next.size(mem))
                    .and_then(|s| s.checked_add(1))
                    .ok_or_else(|| corrupted(mem, next))?;
                mcb.set_size(mem, size);
                let kind = next.kind(mem);
                mcb.set_kind(mem, kind);
                merges += 1;
            } else {
                mcb = next;
            }
        }
        Ok(merges)
    }

    /// Allocates `blocks` paragraphs for the current PSP following the allocation strategy.
    ///
    /// On failure the error carries the size of the largest free block.
    pub fn allocate(&mut self, mem: &mut PcMemory, blocks: u16) -> Result<DosResult<u16>> {
        self.compress(mem, None)?;
        let mut strategy = self.strategy;
        let mut largest = 0u16;
        let mut segment = self.first_mcb;
        if self.umb_start == UMB_START_SEG {
            if strategy & 0xC0 != 0 {
                segment = self.umb_start;
            }
        } else if self.umb_start != NO_UMB_CHAIN {
            warn!(start = self.umb_start, "corrupt UMB chain");
        }

        let psp = self.psp;
        let psp_name = Mcb(psp.wrapping_sub(1)).name(mem);
        let mut found: Option<(u16, u16)> = None;

        loop {
            let mcb = Mcb(segment);
            if !mcb.is_valid(mem) {
                return Err(corrupted(mem, mcb));
            }
            if mcb.owner(mem) == MCB_FREE {
                let size = mcb.size(mem);
                if size < blocks {
                    largest = largest.max(size);
                } else if size == blocks && (strategy & 0x3F) < 2 {
                    mcb.set_owner(mem, psp);
                    return Ok(Ok(segment + 1));
                } else {
                    match strategy & 0x3F {
                        0 => {
                            split_front(mem, mcb, size, blocks, psp, &psp_name);
                            return Ok(Ok(segment + 1));
                        }
                        1 => {
                            if found.map_or(true, |(_, best)| size < best) {
                                found = Some((segment, size));
                            }
                        }
                        _ => found = Some((segment, size)),
                    }
                }
            }

            if mcb.kind(mem) == MCB_LAST {
                if strategy & 0x80 != 0 && self.umb_start == UMB_START_SEG {
                    // High memory first, then low.
                    segment = self.first_mcb;
                    strategy &= !0xC0;
                    continue;
                }
                let Some((seg, size)) = found else {
                    return Ok(Err(SizeError {
                        error: DosError::InsufficientMemory,
                        available: largest,
                    }));
                };
                let mcb = Mcb(seg);
                if strategy & 0x3F == 1 {
                    split_front(mem, mcb, size, blocks, psp, &psp_name);
                    return Ok(Ok(seg + 1));
                }
                // Last fit: carve the block from the end of the free block.
                if size == blocks {
                    mcb.set_owner(mem, psp);
                    mcb.set_name(mem, &psp_name);
                    return Ok(Ok(seg + 1));
                }
                let data = seg + 1 + size - blocks;
                let tail = Mcb(data - 1);
                tail.set_size(mem, blocks);
                let kind = mcb.kind(mem);
                tail.set_kind(mem, kind);
                tail.set_owner(mem, psp);
                tail.set_name(mem, &psp_name);
                mcb.set_size(mem, size - blocks - 1);
                mcb.set_owner(mem, MCB_FREE);
                mcb.set_kind(mem, MCB_MORE);
                return Ok(Ok(data));
            }
            segment = mcb.next(mem).0;
        }
    }

    /// Grows or shrinks the block whose data starts at `segment`.
    pub fn resize(
        &mut self,
        mem: &mut PcMemory,
        segment: u16,
        blocks: u16,
    ) -> Result<DosResult<()>> {
        if segment < DOS_MEM_START + 1 {
            warn!(segment, "program resizes a block below the first MCB");
        }
        let mcb = Mcb(segment.wrapping_sub(1));
        if !mcb.is_valid(mem) {
            return Ok(Err(SizeError {
                error: DosError::McbDestroyed,
                available: 0,
            }));
        }

        self.compress(mem, None)?;
        let psp = self.psp;
        let mut total = mcb.size(mem);
        let next = Mcb(segment.wrapping_add(total));

        if blocks <= total {
            if blocks == total {
                return Ok(Ok(()));
            }
            let new_next = Mcb(segment + blocks);
            mcb.set_size(mem, blocks);
            let kind = mcb.kind(mem);
            new_next.set_kind(mem, kind);
            if kind == MCB_LAST {
                mcb.set_kind(mem, MCB_MORE);
            }
            new_next.set_size(mem, total - blocks - 1);
            new_next.set_owner(mem, MCB_FREE);
            mcb.set_owner(mem, psp);
            return Ok(Ok(()));
        }

        let is_last = mcb.kind(mem) == MCB_LAST;
        let next_free = !is_last && next.owner(mem) == MCB_FREE;
        if next_free {
            total += next.size(mem) + 1;
        }
        if blocks < total {
            if !is_last {
                let kind = next.kind(mem);
                mcb.set_kind(mem, kind);
            }
            mcb.set_size(mem, blocks);
            let split = Mcb(segment + blocks);
            split.set_size(mem, total - blocks - 1);
            let kind = mcb.kind(mem);
            split.set_kind(mem, kind);
            split.set_owner(mem, MCB_FREE);
            mcb.set_kind(mem, MCB_MORE);
            mcb.set_owner(mem, psp);
            return Ok(Ok(()));
        }

        if next_free {
            let kind = next.kind(mem);
            mcb.set_kind(mem, kind);
        }
        mcb.set_size(mem, total);
        mcb.set_owner(mem, psp);
        if blocks == total {
            return Ok(Ok(()));
        }
        Ok(Err(SizeError {
            error: DosError::InsufficientMemory,
            available: total,
        }))
    }

    /// Marks the block at `segment` free. Adjacent free blocks are merged lazily.
    pub fn free(&mut self, mem: &mut PcMemory, segment: u16) -> std::result::Result<(), DosError> {
        if segment <= DOS_MEM_START {
            warn!(segment, "program tried to free a block below the first MCB");
            return Err(DosError::InvalidBlock);
        }
        let mcb = Mcb(segment - 1);
        if !mcb.is_valid(mem) {
            return Err(DosError::InvalidBlock);
        }
        mcb.set_owner(mem, MCB_FREE);
        Ok(())
    }

    /// Frees every block owned by `psp` in the low chain and in the UMB chain.
    pub fn free_process_memory(&mut self, mem: &mut PcMemory, psp: u16) -> Result<()> {
        let mut mcb = Mcb(self.first_mcb);
        loop {
            if mcb.owner(mem) == psp {
                mcb.set_owner(mem, MCB_FREE);
            }
            match mcb.kind(mem) {
                MCB_LAST => break,
                MCB_MORE => mcb = mcb.next(mem),
                _ => return Err(corrupted(mem, mcb)),
            }
        }

        if self.umb_start == UMB_START_SEG {
            let mut umb = Mcb(self.umb_start);
            loop {
                if umb.owner(mem) == psp {
                    umb.set_owner(mem, MCB_FREE);
                }
                if umb.kind(mem) != MCB_MORE {
                    break;
                }
                umb = umb.next(mem);
            }
        } else if self.umb_start != NO_UMB_CHAIN {
            warn!(start = self.umb_start, "corrupt UMB chain");
        }

        self.compress(mem, None)?;
        Ok(())
    }

    /// Sets up the UMB chain over `umb_start..=umb_end`, covering the gap above conventional
    /// memory with a system block. Without UMBs (or without enough RAM) the chain is disabled.
    pub fn build_umb_chain(
        &mut self,
        mem: &mut PcMemory,
        umb: bool,
        umb_start: u16,
        umb_end: u16,
    ) -> Result<()> {
        let enough_ram = mem.size() / 16 >= 0x10FFF;
        if !umb || !enough_ram || umb_end <= umb_start {
            self.umb_start = NO_UMB_CHAIN;
            self.umb_linked = false;
            return Ok(());
        }

        self.umb_start = UMB_START_SEG;
        self.umb_linked = false;

        let first = Mcb(umb_start);
        first.set_owner(mem, MCB_FREE);
        first.set_size(mem, umb_end - umb_start);
        first.set_kind(mem, MCB_LAST);

        let mut mcb = Mcb(self.first_mcb);
        while mcb.kind(mem) != MCB_LAST {
            if !mcb.is_valid(mem) {
                return Err(corrupted(mem, mcb));
            }
            mcb = mcb.next(mem);
        }

        let cover = mcb.next(mem);
        cover.set_kind(mem, MCB_MORE);
        cover.set_owner(mem, MCB_DOS);
        cover.set_size(mem, umb_start - cover.0 - 1);
        cover.set_name(mem, b"SC      ");
        debug!(cover = cover.0, umb_start, umb_end, "UMB chain built");
        Ok(())
    }

    /// Links (`state == 1`) or unlinks (`state == 0`) the UMB chain into the low chain.
    pub fn link_umbs(&mut self, mem: &mut PcMemory, state: u16) -> bool {
        if self.umb_start != UMB_START_SEG {
            if self.umb_start != NO_UMB_CHAIN {
                warn!(start = self.umb_start, "corrupt UMB chain");
            }
            return false;
        }
        if (state & 1 == 1) == self.umb_linked {
            return true;
        }

        let mut segment = self.first_mcb;
        let mut prev = self.first_mcb;
        let mut mcb = Mcb(segment);
        while segment != self.umb_start && mcb.kind(mem) != MCB_LAST {
            prev = segment;
            segment = mcb.next(mem).0;
            mcb = Mcb(segment);
        }
        let prev = Mcb(prev);

        match state {
            0 => {
                if prev.kind(mem) == MCB_MORE && segment == self.umb_start {
                    prev.set_kind(mem, MCB_LAST);
                }
                self.umb_linked = false;
            }
            1 => {
                if mcb.kind(mem) == MCB_LAST {
                    if mcb.next(mem).0 != self.umb_start {
                        warn!("MCB chain no longer reaches the end of memory; not linking UMBs");
                        return false;
                    }
                    mcb.set_kind(mem, MCB_MORE);
                    self.umb_linked = true;
                }
            }
            _ => {
                warn!(state, "invalid UMB link state");
                return false;
            }
        }
        true
    }

    /// Unlinks the UMB chain and forgets it.
    pub fn detach_umb_chain(&mut self, mem: &mut PcMemory) {
        if self.umb_linked {
            self.link_umbs(mem, 0);
        }
        self.umb_start = NO_UMB_CHAIN;
        self.umb_linked = false;
    }

    pub(crate) fn raw_parts(&self) -> [u16; 7] {
        [
            self.first_mcb,
            self.umb_start,
            u16::from(self.umb_linked),
            u16::from(self.strategy),
            self.psp,
            self.private_next,
            self.default_int,
        ]
    }

    pub(crate) fn from_raw_parts(raw: [u16; 7]) -> Self {
        Self {
            first_mcb: raw[0],
            umb_start: raw[1],
            umb_linked: raw[2] != 0,
            strategy: raw[3] as u8,
            psp: raw[4],
            private_next: raw[5],
            default_int: raw[6],
        }
    }
}

/// Splits `size` paragraphs at `mcb` into an owned front part of `blocks` and a free rest.
fn split_front(mem: &mut PcMemory, mcb: Mcb, size: u16, blocks: u16, psp: u16, name: &[u8; 8]) {
    let rest = Mcb(mcb.0 + blocks + 1);
    rest.set_owner(mem, MCB_FREE);
    let kind = mcb.kind(mem);
    rest.set_kind(mem, kind);
    rest.set_size(mem, size - blocks - 1);
    mcb.set_size(mem, blocks);
    mcb.set_kind(mem, MCB_MORE);
    mcb.set_owner(mem, psp);
    mcb.set_name(mem, name);
}

/// Scoped UMB link state for XMS UMB calls: links the chain and forces high-only allocation,
/// then restores both when dropped.
pub struct UmbLinkGuard<'a> {
    arena: &'a mut DosArena,
    mem: &'a mut PcMemory,
    was_linked: bool,
    old_strategy: u8,
}

impl<'a> UmbLinkGuard<'a> {
    pub fn new(arena: &'a mut DosArena, mem: &'a mut PcMemory) -> Self {
        let was_linked = arena.umbs_linked();
        let old_strategy = arena.strategy();
        if !was_linked {
            arena.link_umbs(mem, 1);
        }
        arena.set_strategy(0x40);
        Self {
            arena,
            mem,
            was_linked,
            old_strategy,
        }
    }

    pub fn allocate(&mut self, blocks: u16) -> Result<DosResult<u16>> {
        self.arena.allocate(self.mem, blocks)
    }
}

impl Drop for UmbLinkGuard<'_> {
    fn drop(&mut self) {
        if !self.was_linked {
            self.arena.link_umbs(self.mem, 0);
        }
        self.arena.strategy = self.old_strategy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> (PcMemory, CallbackTable, DosArena) {
        let mut mem = PcMemory::new(2 * 1024 * 1024).unwrap();
        let mut cbs = CallbackTable::new(&mut mem).unwrap();
        let dos = DosArena::setup(&mut mem, &mut cbs).unwrap();
        (mem, cbs, dos)
    }

    fn walk(mem: &mut PcMemory, start: u16) -> Vec<(u16, u8, u16, u16)> {
        let mut out = Vec::new();
        let mut mcb = Mcb(start);
        loop {
            out.push((mcb.0, mcb.kind(mem), mcb.owner(mem), mcb.size(mem)));
            if mcb.kind(mem) != MCB_MORE {
                return out;
            }
            mcb = mcb.next(mem);
        }
    }

    #[test]
    fn initial_chain_layout() {
        let (mut mem, _cbs, _dos) = arena();
        let chain = walk(&mut mem, DOS_MEM_START);
        assert_eq!(
            chain,
            vec![
                (0x158, b'M', MCB_DOS, 1),
                (0x15A, b'M', MCB_FREE, 4),
                (0x15F, b'M', 0x40, 16),
                (0x170, b'Z', MCB_FREE, 0x9E8E),
            ]
        );
        // IVT 1-4 point at the DOS default stub.
        assert_eq!(mem.read_u32(4), 0x0070_0008);
        assert_eq!(mem.read_u32(16), 0x0070_0008);
        assert_eq!(mem.read_u8(0x708), 0xFE);
        assert_eq!(mem.read_u8(0x70C), 0xCF);
    }

    #[test]
    fn first_fit_splits_and_names_the_block() {
        let (mut mem, _cbs, mut dos) = arena();
        // Name the PSP's own MCB so the new block inherits it.
        dos.set_psp(0x1000);
        Mcb(0x0FFF).set_name(&mut mem, b"GAME    ");

        let seg = dos.allocate(&mut mem, 0x100).unwrap().unwrap();
        assert_eq!(seg, 0x171);
        let mcb = Mcb(0x170);
        assert_eq!(mcb.owner(&mut mem), 0x1000);
        assert_eq!(mcb.size(&mut mem), 0x100);
        assert_eq!(mcb.kind(&mut mem), b'M');
        assert_eq!(&mcb.name(&mut mem), b"GAME    ");
        let rest = mcb.next(&mut mem);
        assert_eq!(rest.kind(&mut mem), b'Z');
        assert_eq!(rest.size(&mut mem), 0x9E8E - 0x101);
    }

    #[test]
    fn exact_fit_takes_the_small_free_block() {
        let (mut mem, _cbs, mut dos) = arena();
        let seg = dos.allocate(&mut mem, 4).unwrap().unwrap();
        assert_eq!(seg, 0x15B);
        assert_eq!(Mcb(0x15A).owner(&mut mem), dos.psp());
    }

    #[test]
    fn best_fit_and_last_fit() {
        let (mut mem, _cbs, mut dos) = arena();
        assert!(dos.set_strategy(1));
        let seg = dos.allocate(&mut mem, 2).unwrap().unwrap();
        assert_eq!(seg, 0x15B, "smallest block that fits");
        assert_eq!(Mcb(0x15A).size(&mut mem), 2);

        assert!(dos.set_strategy(2));
        let seg = dos.allocate(&mut mem, 0x10).unwrap().unwrap();
        // Carved from the end of the big free block, just below the UMB link paragraph.
        assert_eq!(seg, 0x9FFF - 0x10);
        assert_eq!(Mcb(seg - 1).kind(&mut mem), b'Z');
        assert_eq!(Mcb(0x170).kind(&mut mem), b'M');
        assert!(!dos.set_strategy(3));
        assert_eq!(dos.strategy(), 2);
    }

    #[test]
    fn allocation_failure_reports_largest_block() {
        let (mut mem, _cbs, mut dos) = arena();
        let err = dos.allocate(&mut mem, 0xF000).unwrap().unwrap_err();
        assert_eq!(err.error, DosError::InsufficientMemory);
        assert_eq!(err.available, 0x9E8E);
    }

    #[test]
    fn resize_shrinks_grows_and_reports_maximum() {
        let (mut mem, _cbs, mut dos) = arena();
        let a = dos.allocate(&mut mem, 0x100).unwrap().unwrap();
        let b = dos.allocate(&mut mem, 0x100).unwrap().unwrap();
        dos.free(&mut mem, b).unwrap();

        dos.resize(&mut mem, a, 0x80).unwrap().unwrap();
        assert_eq!(Mcb(a - 1).size(&mut mem), 0x80);

        dos.resize(&mut mem, a, 0x180).unwrap().unwrap();
        assert_eq!(Mcb(a - 1).size(&mut mem), 0x180);

        let err = dos.resize(&mut mem, a, 0xF000).unwrap().unwrap_err();
        assert_eq!(err.error, DosError::InsufficientMemory);
        assert_eq!(err.available, 0x9E8E);
        assert_eq!(Mcb(a - 1).kind(&mut mem), b'Z');
    }

    #[test]
    fn resize_of_garbage_reports_destroyed_chain() {
        let (mut mem, _cbs, mut dos) = arena();
        let err = dos.resize(&mut mem, 0x5000, 4).unwrap().unwrap_err();
        assert_eq!(err.error, DosError::McbDestroyed);
    }

    #[test]
    fn free_rejects_low_and_invalid_segments() {
        let (mut mem, _cbs, mut dos) = arena();
        assert_eq!(dos.free(&mut mem, DOS_MEM_START), Err(DosError::InvalidBlock));
        assert_eq!(dos.free(&mut mem, 0x5000), Err(DosError::InvalidBlock));
        let seg = dos.allocate(&mut mem, 0x10).unwrap().unwrap();
        assert_eq!(dos.free(&mut mem, seg), Ok(()));
        // Not merged until the next compress.
        assert_eq!(Mcb(seg - 1).size(&mut mem), 0x10);
        assert_eq!(dos.compress(&mut mem, None).unwrap(), 1);
        assert_eq!(dos.compress(&mut mem, None).unwrap(), 0);
    }

    #[test]
    fn free_process_memory_releases_all_owned_blocks() {
        let (mut mem, _cbs, mut dos) = arena();
        dos.set_psp(0x2000);
        let a = dos.allocate(&mut mem, 0x10).unwrap().unwrap();
        dos.set_psp(0x3000);
        let b = dos.allocate(&mut mem, 0x10).unwrap().unwrap();
        dos.set_psp(0x2000);
        let _c = dos.allocate(&mut mem, 0x10).unwrap().unwrap();

        dos.free_process_memory(&mut mem, 0x2000).unwrap();
        assert_eq!(Mcb(a - 1).owner(&mut mem), MCB_FREE);
        assert_eq!(Mcb(b - 1).owner(&mut mem), 0x3000);
    }

    #[test]
    fn corrupt_chain_is_fatal() {
        let (mut mem, _cbs, mut dos) = arena();
        Mcb(0x15A).set_kind(&mut mem, b'X');
        assert!(matches!(
            dos.compress(&mut mem, None),
            Err(FatalError::McbChainCorrupted {
                segment: 0x15A,
                kind: b'X'
            })
        ));
    }

    #[test]
    fn merged_size_past_64k_paragraphs_is_fatal() {
        let (mut mem, _cbs, mut dos) = arena();
        let first = Mcb(0x170);
        first.set_kind(&mut mem, MCB_MORE);
        first.set_owner(&mut mem, MCB_FREE);
        first.set_size(&mut mem, 0x9000);
        let second = Mcb(0x9171);
        second.set_kind(&mut mem, MCB_LAST);
        second.set_owner(&mut mem, MCB_FREE);
        second.set_size(&mut mem, 0x8000);

        assert!(matches!(
            dos.compress(&mut mem, None),
            Err(FatalError::McbChainCorrupted {
                segment: 0x9171,
                kind: b'Z'
            })
        ));
        assert_eq!(first.size(&mut mem), 0x9000);
    }

    #[test]
    fn umb_chain_link_and_unlink() {
        let (mut mem, _cbs, mut dos) = arena();
        dos.build_umb_chain(&mut mem, true, 0xD000, 0xDFFF).unwrap();
        assert_eq!(dos.umb_chain_start(), UMB_START_SEG);
        assert_eq!(
            walk(&mut mem, UMB_START_SEG),
            vec![(0x9FFF, b'M', MCB_DOS, 0x3000), (0xD000, b'Z', MCB_FREE, 0x0FFF)]
        );
        assert_eq!(&Mcb(0x9FFF).name(&mut mem), b"SC      ");

        assert!(dos.link_umbs(&mut mem, 1));
        assert!(dos.umbs_linked());
        assert_eq!(walk(&mut mem, DOS_MEM_START).last().unwrap().0, 0xD000);
        assert!(dos.link_umbs(&mut mem, 1));

        assert!(dos.link_umbs(&mut mem, 0));
        assert!(!dos.umbs_linked());
        assert_eq!(walk(&mut mem, DOS_MEM_START).last().unwrap().0, 0x170);
    }

    #[test]
    fn umb_guard_restores_link_state_and_strategy() {
        let (mut mem, _cbs, mut dos) = arena();
        dos.build_umb_chain(&mut mem, true, 0xD000, 0xDFFF).unwrap();
        dos.set_strategy(1);
        let seg = {
            let mut guard = UmbLinkGuard::new(&mut dos, &mut mem);
            guard.allocate(0x100).unwrap().unwrap()
        };
        assert_eq!(seg, 0xD001);
        assert!(!dos.umbs_linked());
        assert_eq!(dos.strategy(), 1);
    }

    #[test]
    fn private_area_is_bump_allocated() {
        let (_mem, _cbs, mut dos) = arena();
        assert_eq!(dos.get_memory(2).unwrap(), DOS_PRIVATE_SEGMENT);
        assert_eq!(dos.get_memory(0x20).unwrap(), DOS_PRIVATE_SEGMENT + 2);
        assert!(matches!(
            dos.get_memory(0x1000),
            Err(FatalError::PrivateAreaExhausted)
        ));
    }
}

use core::fmt;
use core::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestMemoryError {
    /// `len` bytes at `addr` do not fit inside `ram_size` bytes of RAM.
    OutOfBounds { addr: u64, len: usize, ram_size: u64 },
    /// The host cannot back this much RAM.
    TooLarge { bytes: u64 },
}

impl fmt::Display for GuestMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            GuestMemoryError::OutOfBounds {
                addr,
                len,
                ram_size,
            } => write!(
                f,
                "physical access of {len} bytes at {addr:#x} is outside {ram_size:#x} bytes of RAM"
            ),
            GuestMemoryError::TooLarge { bytes } => {
                write!(f, "cannot allocate {bytes} bytes of guest RAM")
            }
        }
    }
}

impl std::error::Error for GuestMemoryError {}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Physical RAM as seen by the drivers. Accesses never wrap or alias; anything that crosses
/// the end of RAM fails as a whole.
pub trait GuestMemory {
    fn size(&self) -> u64;

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    fn read_byte(&self, paddr: u64) -> GuestMemoryResult<u8> {
        let mut byte = 0u8;
        self.read_into(paddr, core::slice::from_mut(&mut byte))?;
        Ok(byte)
    }

    fn write_byte(&mut self, paddr: u64, value: u8) -> GuestMemoryResult<()> {
        self.write_from(paddr, core::slice::from_ref(&value))
    }

    /// Sets `len` bytes at `paddr` to `value`, a page-sized chunk at a time.
    fn fill(&mut self, paddr: u64, len: usize, value: u8) -> GuestMemoryResult<()> {
        let chunk = [value; 4096];
        let mut offset = 0usize;
        while offset < len {
            let n = chunk.len().min(len - offset);
            self.write_from(paddr + offset as u64, &chunk[..n])?;
            offset += n;
        }
        Ok(())
    }
}

/// RAM backed by one host allocation.
#[derive(Debug, Clone)]
pub struct DenseMemory {
    bytes: Box<[u8]>,
}

impl DenseMemory {
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        let len = usize::try_from(size).map_err(|_| GuestMemoryError::TooLarge { bytes: size })?;
        Ok(Self {
            bytes: vec![0u8; len].into_boxed_slice(),
        })
    }

    fn span(&self, paddr: u64, len: usize) -> GuestMemoryResult<Range<usize>> {
        let out_of_bounds = || GuestMemoryError::OutOfBounds {
            addr: paddr,
            len,
            ram_size: self.size(),
        };
        let start = usize::try_from(paddr).map_err(|_| out_of_bounds())?;
        match start.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(start..end),
            _ => Err(out_of_bounds()),
        }
    }

    /// Copies `len` bytes from `src` to `dst`. Overlapping ranges behave like `memmove`.
    pub fn copy_within(&mut self, src: u64, dst: u64, len: usize) -> GuestMemoryResult<()> {
        let from = self.span(src, len)?;
        let to = self.span(dst, len)?;
        self.bytes.copy_within(from, to.start);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl GuestMemory for DenseMemory {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let span = self.span(paddr, dst.len())?;
        dst.copy_from_slice(&self.bytes[span]);
        Ok(())
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let span = self.span(paddr, src.len())?;
        self.bytes[span].copy_from_slice(src);
        Ok(())
    }
}

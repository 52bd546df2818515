use core::fmt;

/// A linear guest address (32-bit, as produced by real-mode `seg*16 + off` or a 386 descriptor
/// base).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestAddress(u32);

impl GuestAddress {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn offset(self, delta: u32) -> Self {
        Self(self.0.wrapping_add(delta))
    }

    /// 4 KiB page number.
    pub const fn page(self) -> u32 {
        self.0 >> 12
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & 0xFFF
    }
}

impl fmt::LowerHex for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A real-mode far pointer (`segment:offset`).
///
/// The packed 32-bit form stores the segment in the high word, which is how IVT entries and
/// XMS/EMS descriptors carry them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RealPtr {
    pub segment: u16,
    pub offset: u16,
}

impl RealPtr {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    pub const fn from_u32(packed: u32) -> Self {
        Self {
            segment: (packed >> 16) as u16,
            offset: packed as u16,
        }
    }

    pub const fn to_u32(self) -> u32 {
        ((self.segment as u32) << 16) | self.offset as u32
    }

    /// Linear address; may exceed 1 MiB (up to `0x10FFEF`) for `FFFF:xxxx`.
    pub const fn linear(self) -> GuestAddress {
        GuestAddress((self.segment as u32) * 16 + self.offset as u32)
    }
}

impl fmt::Display for RealPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

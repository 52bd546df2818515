/// Abstraction for guest memory access as seen by real-mode and V86 code.
///
/// Addresses are *linear*: below 1 MiB + 64 KiB they are routed through the page map (EMS page
/// frame remaps, A20 wrap), above it they hit physical RAM directly. Accesses never fail; reads
/// outside RAM return open-bus `0xFF` and writes there are dropped. Reads take `&mut self` so
/// implementations may keep access statistics.
pub trait MemoryBus {
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]);
    fn write_bytes(&mut self, addr: u32, buf: &[u8]);

    fn read_u8(&mut self, addr: u32) -> u8 {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf);
        buf[0]
    }

    fn read_u16(&mut self, addr: u32) -> u16 {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf);
        u16::from_le_bytes(buf)
    }

    fn read_u32(&mut self, addr: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u8(&mut self, addr: u32, val: u8) {
        self.write_bytes(addr, &[val]);
    }

    fn write_u16(&mut self, addr: u32, val: u16) {
        self.write_bytes(addr, &val.to_le_bytes());
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        self.write_bytes(addr, &val.to_le_bytes());
    }

    /// Real-mode `seg:off` helpers.
    fn real_read_u8(&mut self, seg: u16, off: u16) -> u8 {
        self.read_u8(crate::RealPtr::new(seg, off).linear().raw())
    }

    fn real_read_u16(&mut self, seg: u16, off: u16) -> u16 {
        self.read_u16(crate::RealPtr::new(seg, off).linear().raw())
    }

    fn real_write_u8(&mut self, seg: u16, off: u16, val: u8) {
        self.write_u8(crate::RealPtr::new(seg, off).linear().raw(), val);
    }

    fn real_write_u16(&mut self, seg: u16, off: u16, val: u16) {
        self.write_u16(crate::RealPtr::new(seg, off).linear().raw(), val);
    }

    fn real_write_u32(&mut self, seg: u16, off: u16, val: u32) {
        self.write_u32(crate::RealPtr::new(seg, off).linear().raw(), val);
    }
}

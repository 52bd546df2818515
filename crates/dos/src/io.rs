use std::collections::HashMap;

/// Port I/O as seen by the stubs and the V86 monitor.
///
/// Every port acts as a simple latch: a read returns the last value written, or a floating bus
/// if nothing was ever written. The PIC acknowledge sequences emitted by the callback stubs land
/// here, which is all the memory managers need from the PIC. Port 92h never reaches the bus; the
/// machine answers it from the A20 gate.
#[derive(Debug, Default)]
pub struct IoPortBus {
    latches: HashMap<u16, u32>,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        if !matches!(size, 1 | 2 | 4) {
            return 0xFFFF_FFFF;
        }
        let mask = size_mask(size);
        self.latches.get(&port).map_or(mask, |v| v & mask)
    }

    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            return;
        }
        self.latches.insert(port, value & size_mask(size));
    }

    /// Last value written to `port`.
    pub fn latched(&self, port: u16) -> Option<u32> {
        self.latches.get(&port).copied()
    }
}

fn size_mask(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_latch_writes() {
        let mut io = IoPortBus::new();
        assert_eq!(io.read(0x20, 1), 0xFF);
        io.write(0x20, 1, 0x20);
        assert_eq!(io.read(0x20, 1), 0x20);
        assert_eq!(io.latched(0x20), Some(0x20));
        io.write(0x60, 2, 0x1_2345);
        assert_eq!(io.read(0x60, 2), 0x2345);
    }

    #[test]
    fn odd_access_sizes_float() {
        let mut io = IoPortBus::new();
        io.write(0x70, 3, 9);
        assert_eq!(io.latched(0x70), None);
        io.write(0x70, 1, 9);
        assert_eq!(io.read(0x70, 3), 0xFFFF_FFFF);
        assert_eq!(io.read(0x70, 4), 9);
    }
}

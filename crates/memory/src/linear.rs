//! Linear-to-physical page map for the first megabyte plus the HMA.
//!
//! Real-mode and V86 code see memory through this table. EMS remaps page-frame pages here and
//! the A20 gate swaps the 16 pages above 1 MiB between the HMA and a wrap onto page 0.

/// Linear pages covered by the map (1 MiB + 64 KiB).
pub const MAPPED_PAGES: usize = 0x110;

/// First linear page affected by the A20 gate.
const HMA_PAGE: u32 = 0x100;
const HMA_PAGES: u32 = 16;

#[derive(Debug, Clone)]
pub struct LinearMap {
    pages: Vec<u32>,
    a20: bool,
    tlb_flushes: u64,
}

impl Default for LinearMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearMap {
    /// Identity map with the A20 gate disabled, which is the power-on state.
    pub fn new() -> Self {
        let mut map = Self {
            pages: (0..MAPPED_PAGES as u32).collect(),
            a20: true,
            tlb_flushes: 0,
        };
        map.set_a20(false);
        map
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20
    }

    pub fn set_a20(&mut self, enabled: bool) {
        let base = if enabled { HMA_PAGE } else { 0 };
        for i in 0..HMA_PAGES {
            self.pages[(HMA_PAGE + i) as usize] = base + i;
        }
        self.a20 = enabled;
    }

    /// Points `linear_page` at `phys_page`. Pages outside the mapped window are ignored and
    /// reported as `false`.
    pub fn map_page(&mut self, linear_page: u32, phys_page: u32) -> bool {
        match self.pages.get_mut(linear_page as usize) {
            Some(slot) => {
                *slot = phys_page;
                true
            }
            None => false,
        }
    }

    /// Current target of `linear_page`; pages beyond the window map onto themselves.
    pub fn lookup(&self, linear_page: u32) -> u32 {
        self.pages
            .get(linear_page as usize)
            .copied()
            .unwrap_or(linear_page)
    }

    /// Invalidates cached translations. The map has no cache of its own; the counter lets callers
    /// observe that a flush was requested.
    pub fn clear_tlb(&mut self) {
        self.tlb_flushes += 1;
    }

    pub fn tlb_flushes(&self) -> u64 {
        self.tlb_flushes
    }

    pub fn translate(&self, linear: u32) -> u64 {
        u64::from(self.lookup(linear >> 12)) * 4096 + u64::from(linear & 0xFFF)
    }

    pub fn entries(&self) -> &[u32] {
        &self.pages
    }

    /// Restores a saved map. Returns `false` (leaving the map untouched) on a size mismatch.
    pub fn restore(&mut self, entries: &[u32], a20: bool) -> bool {
        if entries.len() != MAPPED_PAGES {
            return false;
        }
        self.pages.copy_from_slice(entries);
        self.a20 = a20;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a20_disabled_wraps_hma_onto_low_memory() {
        let mut map = LinearMap::new();
        assert!(!map.a20_enabled());
        assert_eq!(map.translate(0x10_0010), 0x10);
        assert_eq!(map.translate(0x10_FFEF), 0xFFEF);

        map.set_a20(true);
        assert_eq!(map.translate(0x10_0010), 0x10_0010);
        assert_eq!(map.translate(0x20_0000), 0x20_0000);
    }

    #[test]
    fn remap_and_restore_identity() {
        let mut map = LinearMap::new();
        assert!(map.map_page(0xE0, 0x400));
        assert_eq!(map.translate(0xE0123), 0x40_0123);
        assert!(map.map_page(0xE0, 0xE0));
        assert_eq!(map.translate(0xE0123), 0xE0123);
        assert!(!map.map_page(0x200, 0x0));
    }
}

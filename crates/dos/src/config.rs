use std::str::FromStr;

use thiserror::Error;

/// Which flavour of expanded memory to emulate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EmsMode {
    /// No EMS driver.
    None,
    /// EMM386-style software remapper that also behaves like a board where it matters.
    #[default]
    Mixed,
    /// Plain expansion board: page frame and the A000 window only, no VCPI.
    Board,
    /// EMM386-style software remapper.
    Emm386,
}

impl EmsMode {
    pub fn is_active(self) -> bool {
        self != EmsMode::None
    }

    /// Modes that emulate a V86 remapper (any segment below the ROM area can be a target).
    pub fn is_remapper(self) -> bool {
        matches!(self, EmsMode::Mixed | EmsMode::Emm386)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown EMS mode {0:?} (expected false, true, emsboard or emm386)")]
pub struct ParseEmsModeError(pub String);

impl FromStr for EmsMode {
    type Err = ParseEmsModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "false" | "none" => Ok(EmsMode::None),
            "true" | "mixed" => Ok(EmsMode::Mixed),
            "emsboard" | "board" => Ok(EmsMode::Board),
            "emm386" => Ok(EmsMode::Emm386),
            _ => Err(ParseEmsModeError(s.to_string())),
        }
    }
}

/// What INT 67h AH=45h does with a handle whose page map is still saved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SavedMapPolicy {
    /// Release anyway and drop the saved map.
    #[default]
    Lenient,
    /// Refuse with EMM error 0x86.
    Strict,
}

/// Settings read once when the memory subsystem is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Total guest RAM in bytes.
    pub memory_size_bytes: u64,
    pub xms: bool,
    /// XMS handle table size, including the reserved handle 0.
    pub xms_handles: u16,
    /// Smallest HMA request (in bytes) that is granted. Requests from TSRs and drivers
    /// (`DX = FFFFh`) are always honoured.
    pub hma_min_alloc: u16,
    /// The DOS kernel itself lives in the HMA.
    pub dos_in_hma: bool,
    pub umb: bool,
    pub umb_start: u16,
    pub umb_end: u16,
    pub ems: EmsMode,
    pub vcpi: bool,
    /// Switch the CPU into virtual-8086 mode once EMS is up.
    pub v86_startup: bool,
    /// Port 0x92 accesses trapped in V86 mode only touch a virtual A20 flag.
    pub vcpi_virtual_a20: bool,
    pub ems_system_handle_even_megabyte: bool,
    pub ems_release_with_saved_map: SavedMapPolicy,
    pub zero_memory_on_xms_alloc: bool,
    pub zero_memory_on_ems_alloc: bool,
    /// Instructions a nested `run_real_*` call may execute before it is considered stuck.
    pub run_step_limit: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_size_bytes: 16 * 1024 * 1024,
            xms: true,
            xms_handles: 256,
            hma_min_alloc: 0,
            dos_in_hma: false,
            umb: true,
            umb_start: 0xD000,
            umb_end: 0xEFFF,
            ems: EmsMode::Mixed,
            vcpi: true,
            v86_startup: false,
            vcpi_virtual_a20: true,
            ems_system_handle_even_megabyte: true,
            ems_release_with_saved_map: SavedMapPolicy::Lenient,
            zero_memory_on_xms_alloc: false,
            zero_memory_on_ems_alloc: false,
            run_step_limit: 50_000_000,
        }
    }
}

impl MemoryConfig {
    pub fn xms_handle_count(&self) -> usize {
        usize::from(self.xms_handles.clamp(2, 256))
    }

    /// VCPI is never offered by a plain expansion board.
    pub fn vcpi_enabled(&self) -> bool {
        self.vcpi && self.ems.is_active() && self.ems != EmsMode::Board
    }

    /// Last UMB segment; the page frame takes E000-EFFF when EMS is active.
    pub fn umb_end_segment(&self) -> u16 {
        if self.ems.is_active() {
            self.umb_end.min(0xDFFF)
        } else {
            self.umb_end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ems_mode_parses_config_strings() {
        assert_eq!("false".parse::<EmsMode>().unwrap(), EmsMode::None);
        assert_eq!("true".parse::<EmsMode>().unwrap(), EmsMode::Mixed);
        assert_eq!("EMSBOARD".parse::<EmsMode>().unwrap(), EmsMode::Board);
        assert_eq!(" emm386 ".parse::<EmsMode>().unwrap(), EmsMode::Emm386);
        assert!("ems".parse::<EmsMode>().is_err());
    }

    #[test]
    fn derived_settings() {
        let mut cfg = MemoryConfig::default();
        assert!(cfg.vcpi_enabled());
        assert_eq!(cfg.umb_end_segment(), 0xDFFF);
        cfg.ems = EmsMode::Board;
        assert!(!cfg.vcpi_enabled());
        cfg.ems = EmsMode::None;
        assert_eq!(cfg.umb_end_segment(), 0xEFFF);
        cfg.xms_handles = 4000;
        assert_eq!(cfg.xms_handle_count(), 256);
    }
}

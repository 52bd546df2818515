//! DOS memory management for an emulated PC: the XMS and EMS drivers (with VCPI and a
//! virtual-8086 monitor), the DOS MCB arena and the callback table that lets guest code trap
//! into native handlers.
//!
//! Everything hangs off [`Machine`], which owns guest memory and the CPU register file and runs
//! guest code between callback traps.

pub mod callback;
pub mod config;
pub mod cpu;
pub mod dos_memory;
pub mod ems;
pub mod error;
pub mod io;
pub mod machine;
pub mod snapshot;
pub mod xms;

pub use callback::{CallbackReturn, CallbackTable, Handler, HandlerObject, StubKind};
pub use config::{EmsMode, MemoryConfig, SavedMapPolicy};
pub use cpu::CpuState;
pub use dos_memory::DosArena;
pub use ems::Ems;
pub use error::{DosError, EmmError, FatalError, Result, XmsError};
pub use machine::{Machine, RunExit};
pub use snapshot::SnapshotError;
pub use xms::Xms;

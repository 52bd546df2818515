//! DOS XMS/EMS memory managers for an emulated PC.
//!
//! This crate re-exports the workspace members: [`memory`] for guest RAM, the page allocator and
//! the first-megabyte page map, and [`dos`] for the managers and the [`Machine`] that owns them.

pub use dos;
pub use memory;

pub use dos::{EmsMode, FatalError, Machine, MemoryConfig, RunExit};

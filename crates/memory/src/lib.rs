//! Guest memory for the DOS memory managers: RAM storage, linear/physical access, the 4 KiB
//! page allocator behind XMS and EMS, and the first-megabyte page map with its A20 gate.

pub mod addr;
pub mod alloc;
pub mod bus;
pub mod linear;
pub mod pc;
pub mod phys;

pub use addr::{GuestAddress, RealPtr};
pub use alloc::{MemHandle, PageAllocator, Reallocation, PAGE_SIZE, XMS_START};
pub use bus::MemoryBus;
pub use linear::{LinearMap, MAPPED_PAGES};
pub use pc::PcMemory;
pub use phys::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult};

#[cfg(test)]
mod tests;

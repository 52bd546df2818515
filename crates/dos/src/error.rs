use memory::GuestMemoryError;
use thiserror::Error;

/// Conditions that end the emulation session.
///
/// These mirror the "cannot happen with well-formed callers" aborts of a real-mode memory
/// manager. They propagate up to [`crate::Machine`]'s caller, which is expected to shut the
/// session down cleanly.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("no free callback slots")]
    CallbackExhausted,

    #[error("illegal callback stub: {0}")]
    IllegalStubKind(&'static str),

    #[error("illegal callback {0} called")]
    IllegalCallback(u16),

    #[error("DOS MCB chain corrupted at segment {segment:#06x} (type byte {kind:#04x})")]
    McbChainCorrupted { segment: u16, kind: u8 },

    #[error("unhandled opcode {opcode:#04x} in V86 monitor at {cs:04x}:{ip:04x}")]
    UnhandledV86Opcode { cs: u16, ip: u16, opcode: u8 },

    #[error("invalid control register access in V86 monitor")]
    InvalidCrAccess,

    #[error("memory allocation failure: {0}")]
    AllocationFailure(&'static str),

    #[error("not enough DOS private memory for internal tables")]
    PrivateAreaExhausted,

    #[error("guest code did not return to the stop callback within {steps} steps")]
    RunawayGuest { steps: u64 },

    #[error("stub interpreter cannot execute opcode {opcode:#04x} at {cs:04x}:{ip:04x}")]
    UnknownInstruction { cs: u16, ip: u16, opcode: u8 },

    #[error("no usable interrupt gate for vector {0:#04x}")]
    MissingInterruptGate(u8),

    #[error("guest requested a system reset through port 0x92")]
    ResetRequested,

    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, FatalError>;

/// DOS error codes surfaced by the MCB arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u8)]
pub enum DosError {
    #[error("memory control blocks destroyed")]
    McbDestroyed = 7,
    #[error("insufficient memory")]
    InsufficientMemory = 8,
    #[error("memory block address invalid")]
    InvalidBlock = 9,
}

impl DosError {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Error bytes returned in BL by the XMS driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u8)]
pub enum XmsError {
    #[error("function not implemented")]
    NotImplemented = 0x80,
    #[error("VDISK device detected")]
    VdiskDetected = 0x81,
    #[error("A20 error")]
    A20Error = 0x82,
    #[error("general driver error")]
    DriverError = 0x8e,
    #[error("unrecoverable driver error")]
    UnrecoverableDriverError = 0x8f,
    #[error("HMA does not exist")]
    HmaNotExist = 0x90,
    #[error("HMA already in use")]
    HmaInUse = 0x91,
    #[error("HMA request below the minimum allocation")]
    HmaTooSmall = 0x92,
    #[error("HMA not allocated")]
    HmaNotAllocated = 0x93,
    #[error("A20 line still enabled")]
    A20StillEnabled = 0x94,
    #[error("all extended memory is allocated")]
    OutOfSpace = 0xa0,
    #[error("all extended memory handles are in use")]
    OutOfHandles = 0xa1,
    #[error("invalid handle")]
    InvalidHandle = 0xa2,
    #[error("invalid source handle")]
    InvalidSourceHandle = 0xa3,
    #[error("invalid source offset")]
    InvalidSourceOffset = 0xa4,
    #[error("invalid destination handle")]
    InvalidDestHandle = 0xa5,
    #[error("invalid destination offset")]
    InvalidDestOffset = 0xa6,
    #[error("invalid length")]
    InvalidLength = 0xa7,
    #[error("invalid overlap in move")]
    InvalidOverlap = 0xa8,
    #[error("parity error")]
    ParityError = 0xa9,
    #[error("block is not locked")]
    BlockNotLocked = 0xaa,
    #[error("block is locked")]
    BlockLocked = 0xab,
    #[error("lock count overflow")]
    LockCountOverflow = 0xac,
    #[error("lock failed")]
    LockFailed = 0xad,
    #[error("only a smaller UMB is available")]
    UmbOnlySmallerBlock = 0xb0,
    #[error("no UMBs are available")]
    UmbNoBlocksAvailable = 0xb1,
    #[error("invalid UMB segment")]
    UmbInvalidSegment = 0xb2,
}

impl XmsError {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Error bytes returned in AH by the INT 67h expanded memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u8)]
pub enum EmmError {
    #[error("EMM software malfunction")]
    SoftwareMalfunction = 0x80,
    #[error("EMM hardware malfunction")]
    HardwareMalfunction = 0x81,
    #[error("invalid handle")]
    InvalidHandle = 0x83,
    #[error("function not supported")]
    FunctionNotSupported = 0x84,
    #[error("no more handles")]
    OutOfHandles = 0x85,
    #[error("error in save/restore of mapping context")]
    SaveMapError = 0x86,
    #[error("more pages requested than physically exist")]
    OutOfPhysicalPages = 0x87,
    #[error("more pages requested than currently available")]
    OutOfLogicalPages = 0x88,
    #[error("zero pages requested")]
    ZeroPages = 0x89,
    #[error("logical page out of range")]
    LogicalOutOfRange = 0x8a,
    #[error("illegal physical page")]
    IllegalPhysicalPage = 0x8b,
    #[error("mapping context already saved")]
    PageMapSaved = 0x8d,
    #[error("no mapping context saved")]
    NoSavedPageMap = 0x8e,
    #[error("invalid sub-function")]
    InvalidSubFunction = 0x8f,
    #[error("feature not supported")]
    FeatureNotSupported = 0x91,
    #[error("source and destination overlap in move")]
    MoveOverlap = 0x92,
    #[error("region length exceeds 1 MB")]
    RegionTooLong = 0x96,
    #[error("source and destination overlap in exchange")]
    ExchangeOverlap = 0x97,
    #[error("handle name not found")]
    NotFound = 0xa0,
    #[error("conventional memory region wraps the 1 MB boundary")]
    ConventionalWrap = 0xa2,
}

impl EmmError {
    pub fn code(self) -> u8 {
        self as u8
    }
}

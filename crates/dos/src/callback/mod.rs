//! Callback slots: small pieces of guest code in the BIOS segment that trap back into native
//! handlers.
//!
//! Slot `id` lives at `F000:(1000 + id*32)`. Executing its trap (`FE 38 id`) makes the stub
//! interpreter return [`crate::callback::interp::ExecOutcome::Callback`], and the machine runs
//! the slot's [`Handler`]. After the slot area follows a block of 256 six-byte
//! `INT nn; <stop trap>` sequences used to call real-mode interrupts from native code.

pub mod interp;
pub mod stubs;

use std::fmt;
use std::rc::Rc;

use memory::{MemoryBus, PcMemory, RealPtr};
use tracing::{debug, error, warn};

use crate::error::{FatalError, Result};
use crate::machine::Machine;

pub use interp::{ExecOutcome, ExecutionEngine, StubInterpreter};
pub use stubs::{build_stub, StubKind, TRAP_OPCODE};

pub const CB_SEG: u16 = 0xF000;
pub const CB_SOFFSET: u16 = 0x1000;
pub const CB_SIZE: u16 = 32;
pub const CB_MAX: u16 = 128;
/// Linear address of slot 0.
pub const CB_BASE: u32 = ((CB_SEG as u32) << 4) + CB_SOFFSET as u32;
/// Offset (in `CB_SEG`) of the run-real-interrupt block.
pub const RUN_REAL_INT_OFFSET: u16 = CB_SOFFSET + CB_MAX * CB_SIZE;

/// What a handler asks the dispatcher to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackReturn {
    /// Resume the guest after the trap.
    Next,
    /// Leave the innermost nested run loop.
    Stop,
}

/// Snapshot tag of [`Handler::Native`].
const NATIVE_TAG: u8 = 0xFF;

pub type NativeHandler = Rc<dyn Fn(&mut Machine) -> Result<CallbackReturn>>;

/// The native side of a callback slot.
#[derive(Clone)]
pub enum Handler {
    /// Free slot; reaching its trap is fatal.
    Illegal,
    /// Allocated, but only its guest code is used.
    Reserved,
    Stop,
    Default,
    DosDefault,
    Xms,
    Multiplex,
    Int67,
    Int4B,
    VcpiPm,
    V86Monitor,
    Native(NativeHandler),
}

impl Handler {
    pub fn is_free(&self) -> bool {
        matches!(self, Handler::Illegal)
    }

    /// Whether the slot's stub carries a trap into this handler.
    pub fn traps(&self) -> bool {
        !matches!(self, Handler::Illegal | Handler::Reserved)
    }

    /// Stable tag for snapshots. Native closures cannot be serialized and restore as
    /// [`Handler::Reserved`].
    pub fn tag(&self) -> u8 {
        match self {
            Handler::Illegal => 0,
            Handler::Reserved => 1,
            Handler::Stop => 2,
            Handler::Default => 3,
            Handler::DosDefault => 4,
            Handler::Xms => 5,
            Handler::Multiplex => 6,
            Handler::Int67 => 7,
            Handler::Int4B => 8,
            Handler::VcpiPm => 9,
            Handler::V86Monitor => 10,
            Handler::Native(_) => NATIVE_TAG,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Handler::Illegal,
            1 | NATIVE_TAG => Handler::Reserved,
            2 => Handler::Stop,
            3 => Handler::Default,
            4 => Handler::DosDefault,
            5 => Handler::Xms,
            6 => Handler::Multiplex,
            7 => Handler::Int67,
            8 => Handler::Int4B,
            9 => Handler::VcpiPm,
            10 => Handler::V86Monitor,
            _ => return None,
        })
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Handler::Illegal => "Illegal",
            Handler::Reserved => "Reserved",
            Handler::Stop => "Stop",
            Handler::Default => "Default",
            Handler::DosDefault => "DosDefault",
            Handler::Xms => "Xms",
            Handler::Multiplex => "Multiplex",
            Handler::Int67 => "Int67",
            Handler::Int4B => "Int4B",
            Handler::VcpiPm => "VcpiPm",
            Handler::V86Monitor => "V86Monitor",
            Handler::Native(_) => "Native",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
struct Slot {
    handler: Handler,
    description: Option<String>,
}

impl Slot {
    fn free() -> Self {
        Self {
            handler: Handler::Illegal,
            description: None,
        }
    }
}

/// Reads IVT entry `vector`.
pub fn real_get_vec<B: MemoryBus + ?Sized>(mem: &mut B, vector: u8) -> RealPtr {
    RealPtr::from_u32(mem.read_u32(u32::from(vector) * 4))
}

pub fn real_set_vec<B: MemoryBus + ?Sized>(mem: &mut B, vector: u8, ptr: RealPtr) {
    mem.write_u32(u32::from(vector) * 4, ptr.to_u32());
}

/// Writes IVT entry `vector` and returns the previous value.
pub fn real_swap_vec<B: MemoryBus + ?Sized>(mem: &mut B, vector: u8, ptr: RealPtr) -> RealPtr {
    let old = real_get_vec(mem, vector);
    real_set_vec(mem, vector, ptr);
    old
}

#[derive(Debug)]
pub struct CallbackTable {
    slots: Vec<Slot>,
    stop: u16,
    idle: u16,
    default: u16,
    default2: u16,
    priv_io: u16,
}

impl CallbackTable {
    /// Initializes the slot area and the interrupt vector table.
    ///
    /// Sets up the stop, idle and default slots, points the low IVT entries at the default
    /// IRET stub, writes the run-real-interrupt block and the privileged port I/O helpers.
    pub fn new(mem: &mut PcMemory) -> Result<Self> {
        let mut table = Self {
            slots: vec![Slot::free(); usize::from(CB_MAX)],
            stop: 0,
            idle: 0,
            default: 0,
            default2: 0,
            priv_io: 0,
        };

        table.stop = table.allocate()?;
        table.set_handler(table.stop, Handler::Stop, "stop");
        let [lo, hi] = table.stop.to_le_bytes();
        mem.phys_write(
            u64::from(table.phys_pointer(table.stop)),
            &[TRAP_OPCODE[0], TRAP_OPCODE[1], lo, hi],
        )?;

        table.idle = table.allocate()?;
        table.set_handler(table.idle, Handler::Stop, "idle");
        let [lo, hi] = table.idle.to_le_bytes();
        let mut idle = [0x90u8; 16];
        idle[12..].copy_from_slice(&[TRAP_OPCODE[0], TRAP_OPCODE[1], lo, hi]);
        mem.phys_write(u64::from(table.phys_pointer(table.idle)), &idle)?;

        table.default = table.allocate()?;
        table.setup(mem, table.default, Handler::Default, StubKind::Iret, "default")?;
        table.default2 = table.allocate()?;
        table.setup(mem, table.default2, Handler::Default, StubKind::Iret, "default")?;

        let default = table.real_pointer(table.default);
        for vector in (0x00..0x60).chain(0x68..0x70) {
            real_set_vec(mem, vector, default);
        }
        real_set_vec(mem, 0x0E, table.real_pointer(table.default2));
        for vector in [0x66, 0x67, 0x68, 0x5C] {
            real_set_vec(mem, vector, default);
        }

        let stop = table.stop.to_le_bytes();
        let mut block = Vec::with_capacity(256 * 6);
        for vector in 0..=255u8 {
            block.extend_from_slice(&[0xCD, vector, TRAP_OPCODE[0], TRAP_OPCODE[1], stop[0], stop[1]]);
        }
        mem.phys_write(
            u64::from(RealPtr::new(CB_SEG, RUN_REAL_INT_OFFSET).linear().raw()),
            &block,
        )?;

        // Privileged port access helpers for protected-mode code: in al/ax/eax,dx and
        // out dx,al/ax/eax, each followed by retf.
        table.priv_io = table.allocate()?;
        table.set_description(table.priv_io, "private I/O");
        let base = u64::from(table.phys_pointer(table.priv_io));
        mem.phys_write(base, &[0xEC, 0xCB, 0xED, 0xCB, 0x66, 0xED, 0xCB])?;
        mem.phys_write(base + 8, &[0xEE, 0xCB, 0xEF, 0xCB, 0x66, 0xEF, 0xCB])?;

        debug!(stop = table.stop, idle = table.idle, "callback area initialized");
        Ok(table)
    }

    /// Claims the first free slot. Running out of slots is fatal.
    pub fn allocate(&mut self) -> Result<u16> {
        match (1..CB_MAX).find(|&id| self.slots[usize::from(id)].handler.is_free()) {
            Some(id) => {
                self.slots[usize::from(id)].handler = Handler::Reserved;
                Ok(id)
            }
            None => {
                error!("can't allocate callback handler");
                Err(FatalError::CallbackExhausted)
            }
        }
    }

    /// Frees slot `id` and zeroes its code.
    pub fn deallocate(&mut self, mem: &mut PcMemory, id: u16) -> Result<()> {
        let Some(slot) = self.slots.get_mut(usize::from(id)) else {
            return Err(FatalError::IllegalCallback(id));
        };
        *slot = Slot::free();
        mem.phys_write(u64::from(self.phys_pointer(id)), &[0u8; CB_SIZE as usize])?;
        Ok(())
    }

    /// Writes the stub for `id` into its own slot.
    pub fn setup(
        &mut self,
        mem: &mut PcMemory,
        id: u16,
        handler: Handler,
        kind: StubKind,
        description: &str,
    ) -> Result<usize> {
        let addr = self.phys_pointer(id);
        self.setup_at(mem, id, handler, kind, addr, description)
    }

    /// Writes the stub for `id` at an arbitrary linear address (drivers place theirs inside
    /// their own segment).
    pub fn setup_at(
        &mut self,
        mem: &mut PcMemory,
        id: u16,
        handler: Handler,
        kind: StubKind,
        addr: u32,
        description: &str,
    ) -> Result<usize> {
        if id == 0 || id >= CB_MAX {
            return Err(FatalError::IllegalCallback(id));
        }
        let code = build_stub(id, kind, handler.traps())?;
        mem.phys_write(u64::from(addr), &code)?;
        debug!(id, kind = kind.name(), addr, description, "callback installed");
        self.set_handler(id, handler, description);
        Ok(code.len())
    }

    pub fn set_handler(&mut self, id: u16, handler: Handler, description: &str) {
        if let Some(slot) = self.slots.get_mut(usize::from(id)) {
            slot.handler = handler;
            slot.description = Some(description.to_string());
        }
    }

    pub fn set_description(&mut self, id: u16, description: &str) {
        if let Some(slot) = self.slots.get_mut(usize::from(id)) {
            slot.description = Some(description.to_string());
        }
    }

    pub fn handler(&self, id: u16) -> Option<&Handler> {
        self.slots.get(usize::from(id)).map(|s| &s.handler)
    }

    pub fn description(&self, id: u16) -> Option<&str> {
        self.slots
            .get(usize::from(id))
            .and_then(|s| s.description.as_deref())
    }

    pub fn real_pointer(&self, id: u16) -> RealPtr {
        RealPtr::new(CB_SEG, CB_SOFFSET + id * CB_SIZE)
    }

    pub fn phys_pointer(&self, id: u16) -> u32 {
        CB_BASE + u32::from(id) * u32::from(CB_SIZE)
    }

    /// Entry `vector` of the run-real-interrupt block.
    pub fn run_real_int_pointer(&self, vector: u8) -> RealPtr {
        RealPtr::new(CB_SEG, RUN_REAL_INT_OFFSET + u16::from(vector) * 6)
    }

    pub fn stop_id(&self) -> u16 {
        self.stop
    }

    pub fn idle_id(&self) -> u16 {
        self.idle
    }

    pub fn default_id(&self) -> u16 {
        self.default
    }

    /// Far pointer to the `in`/`out` helpers: `+0` byte, `+2` word, `+4` dword reads and `+8`
    /// onwards the matching writes.
    pub fn priv_io_pointer(&self) -> RealPtr {
        self.real_pointer(self.priv_io)
    }

    pub fn allocated(&self) -> impl Iterator<Item = u16> + '_ {
        (0..CB_MAX).filter(|&id| !self.slots[usize::from(id)].handler.is_free())
    }

    pub(crate) fn snapshot_slots(&self) -> Vec<(u8, Option<String>)> {
        self.slots
            .iter()
            .map(|s| (s.handler.tag(), s.description.clone()))
            .collect()
    }

    pub(crate) fn special_slots(&self) -> [u16; 5] {
        [self.stop, self.idle, self.default, self.default2, self.priv_io]
    }

    pub(crate) fn restore_slots(
        &mut self,
        slots: Vec<(u8, Option<String>)>,
        special: [u16; 5],
    ) -> Option<()> {
        if slots.len() != usize::from(CB_MAX) {
            return None;
        }
        let mut restored = Vec::with_capacity(slots.len());
        for ((tag, description), live) in slots.into_iter().zip(&self.slots) {
            let handler = match (&live.handler, tag) {
                (Handler::Native(f), NATIVE_TAG) => Handler::Native(Rc::clone(f)),
                // The closure of a saved native slot must have been registered again.
                (_, NATIVE_TAG) => return None,
                _ => Handler::from_tag(tag)?,
            };
            restored.push(Slot {
                handler,
                description,
            });
        }
        self.slots = restored;
        [self.stop, self.idle, self.default, self.default2, self.priv_io] = special;
        Some(())
    }
}

/// Owner of one callback slot plus the interrupt vector it may have taken over.
///
/// Dropping a `HandlerObject` without calling [`HandlerObject::uninstall`] leaks the slot; the
/// machine keeps its objects for the lifetime of the driver that installed them.
#[derive(Debug)]
pub struct HandlerObject {
    id: u16,
    entry: RealPtr,
    vector: Option<(u8, RealPtr)>,
}

impl HandlerObject {
    pub fn install(
        table: &mut CallbackTable,
        mem: &mut PcMemory,
        handler: Handler,
        kind: StubKind,
        description: &str,
    ) -> Result<Self> {
        let id = table.allocate()?;
        table.setup(mem, id, handler, kind, description)?;
        Ok(Self {
            id,
            entry: table.real_pointer(id),
            vector: None,
        })
    }

    /// Installs the stub at `at` instead of the slot's own address.
    pub fn install_at(
        table: &mut CallbackTable,
        mem: &mut PcMemory,
        handler: Handler,
        kind: StubKind,
        at: RealPtr,
        description: &str,
    ) -> Result<Self> {
        let id = table.allocate()?;
        table.setup_at(mem, id, handler, kind, at.linear().raw(), description)?;
        Ok(Self {
            id,
            entry: at,
            vector: None,
        })
    }

    /// Claims a slot without writing any code.
    pub fn allocate(table: &mut CallbackTable, handler: Handler, description: &str) -> Result<Self> {
        let id = table.allocate()?;
        table.set_handler(id, handler, description);
        Ok(Self {
            id,
            entry: table.real_pointer(id),
            vector: None,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Where the stub was installed.
    pub fn entry(&self) -> RealPtr {
        self.entry
    }

    pub fn hooked_vector(&self) -> Option<(u8, RealPtr)> {
        self.vector
    }

    /// Points IVT entry `vector` at the stub, remembering the previous value.
    pub fn set_real_vec(&mut self, mem: &mut PcMemory, vector: u8) {
        let entry = self.entry;
        self.set_real_vec_to(mem, vector, entry);
    }

    /// Points IVT entry `vector` at `target` (a wrapper in front of the stub, for example).
    pub fn set_real_vec_to(&mut self, mem: &mut PcMemory, vector: u8, target: RealPtr) {
        if let Some((old_vector, _)) = self.vector {
            warn!(id = self.id, old_vector, vector, "callback already hooks a vector");
        }
        let old = real_swap_vec(mem, vector, target);
        self.vector = Some((vector, old));
    }

    /// Restores the hooked vector (unless someone chained over us) and frees the slot.
    pub fn uninstall(self, table: &mut CallbackTable, mem: &mut PcMemory) -> Result<()> {
        if let Some((vector, old)) = self.vector {
            let current = real_get_vec(mem, vector);
            let ours = current == self.entry || current == table.real_pointer(self.id);
            if ours {
                real_set_vec(mem, vector, old);
            } else {
                warn!(
                    id = self.id,
                    vector,
                    current = %current,
                    "interrupt vector was hooked by someone else; leaving it"
                );
            }
        }
        table.deallocate(mem, self.id)
    }
}

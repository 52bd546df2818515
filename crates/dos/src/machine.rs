//! The memory subsystem context: guest memory, the CPU register file, the callback table and
//! the three managers, plus the run loop that executes guest code between callback traps.

use std::rc::Rc;

use memory::{MemoryBus, PcMemory, RealPtr};
use tracing::{debug, error, trace, warn};

use crate::callback::{CallbackReturn, CallbackTable, ExecOutcome, ExecutionEngine, Handler, HandlerObject, StubInterpreter};
use crate::config::MemoryConfig;
use crate::cpu::{CpuState, EFlags, SegReg};
use crate::dos_memory::DosArena;
use crate::ems::Ems;
use crate::error::{FatalError, Result};
use crate::io::IoPortBus;
use crate::xms::Xms;

/// System control port A: bit 0 resets the machine, bit 1 is the fast A20 gate.
pub const PORT_A20_FAST: u16 = 0x92;

/// The stack the BIOS leaves behind before DOS loads a program.
const BOOT_STACK: RealPtr = RealPtr::new(0x0030, 0x0100);

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// A handler asked the innermost run loop to stop.
    Stopped { executed: u64 },
    /// The guest executed `HLT` outside V86 mode.
    Halted { executed: u64 },
    /// The instruction budget was used up.
    Completed { executed: u64 },
}

impl RunExit {
    pub fn executed(&self) -> u64 {
        match *self {
            RunExit::Stopped { executed }
            | RunExit::Halted { executed }
            | RunExit::Completed { executed } => executed,
        }
    }
}

pub struct Machine {
    pub cpu: CpuState,
    pub mem: PcMemory,
    pub io: IoPortBus,
    pub callbacks: CallbackTable,
    pub dos: DosArena,
    pub xms: Option<Xms>,
    pub ems: Option<Ems>,

    pub(crate) config: MemoryConfig,
    pub(crate) engine: Rc<dyn ExecutionEngine>,
    pub(crate) vdma: Option<HandlerObject>,
    /// Port 92h bits other than A20 as last written through the V86 monitor.
    pub(crate) a20_latch: u8,
    /// A20 state seen by V86 code when port 92h is virtualized.
    pub(crate) virtual_a20: bool,
    pub(crate) last_interrupt: Option<u8>,
    pub(crate) last_callback: Option<u16>,
}

impl Machine {
    /// Builds guest memory and brings the subsystem up in DOS boot order: callback area, MCB
    /// arena, XMS, then EMS (which may switch the CPU into V86 mode).
    pub fn new(config: MemoryConfig) -> Result<Self> {
        let mut mem = PcMemory::new(config.memory_size_bytes)?;
        let mut callbacks = CallbackTable::new(&mut mem)?;
        let mut dos = DosArena::setup(&mut mem, &mut callbacks)?;
        let xms = if config.xms {
            Some(Xms::install(&config, &mut mem, &mut callbacks, &mut dos)?)
        } else {
            None
        };

        let mut cpu = CpuState::default();
        let stop = callbacks.real_pointer(callbacks.stop_id());
        cpu.set_real_seg(SegReg::Cs, stop.segment);
        cpu.eip = u32::from(stop.offset);
        cpu.set_real_seg(SegReg::Ss, BOOT_STACK.segment);
        cpu.esp = u32::from(BOOT_STACK.offset);

        let mut machine = Self {
            cpu,
            mem,
            io: IoPortBus::new(),
            callbacks,
            dos,
            xms,
            ems: None,
            config,
            engine: Rc::new(StubInterpreter),
            vdma: None,
            a20_latch: 0,
            virtual_a20: false,
            last_interrupt: None,
            last_callback: None,
        };
        machine.install_ems()?;
        debug!(
            memory = machine.config.memory_size_bytes,
            xms = machine.xms.is_some(),
            ems = machine.ems.is_some(),
            "memory subsystem ready"
        );
        Ok(machine)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Replaces the instruction engine used between callback traps.
    pub fn set_engine(&mut self, engine: Rc<dyn ExecutionEngine>) {
        self.engine = engine;
    }

    /// Callback id of the last trap that was dispatched.
    pub fn last_callback(&self) -> Option<u16> {
        self.last_callback
    }

    /// Runs guest code for at most `max_steps` instructions. Callback traps are dispatched as
    /// they are reached and do not count as instructions.
    pub fn run(&mut self, max_steps: u64) -> Result<RunExit> {
        let mut executed = 0u64;
        while executed < max_steps {
            let engine = Rc::clone(&self.engine);
            match engine.step(self)? {
                ExecOutcome::Continue => executed += 1,
                ExecOutcome::Callback(id) => {
                    if self.dispatch_callback(id)? == CallbackReturn::Stop {
                        return Ok(RunExit::Stopped { executed });
                    }
                }
                ExecOutcome::Halt => {
                    self.cpu.halted = false;
                    return Ok(RunExit::Halted { executed: executed + 1 });
                }
            }
        }
        Ok(RunExit::Completed { executed })
    }

    /// Re-enters the run loop until the stop callback is reached.
    fn run_nested(&mut self) -> Result<()> {
        let limit = self.config.run_step_limit;
        let mut executed = 0u64;
        loop {
            match self.run(limit - executed)? {
                RunExit::Stopped { .. } => return Ok(()),
                // Nothing raises interrupts here, so a halted guest just resumes.
                RunExit::Halted { executed: n } => executed += n,
                RunExit::Completed { .. } => {
                    error!(steps = limit, "nested guest call never returned");
                    return Err(FatalError::RunawayGuest { steps: limit });
                }
            }
            if executed >= limit {
                error!(steps = limit, "nested guest call never returned");
                return Err(FatalError::RunawayGuest { steps: limit });
            }
        }
    }

    /// Runs the native handler behind callback slot `id`.
    pub fn dispatch_callback(&mut self, id: u16) -> Result<CallbackReturn> {
        let Some(handler) = self.callbacks.handler(id).cloned() else {
            error!(id, "callback id out of range");
            return Err(FatalError::IllegalCallback(id));
        };
        self.last_callback = Some(id);
        trace!(id, ?handler, "callback");
        match handler {
            Handler::Illegal | Handler::Reserved => {
                error!(id, "illegal callback called");
                Err(FatalError::IllegalCallback(id))
            }
            Handler::Stop => Ok(CallbackReturn::Stop),
            Handler::Default => {
                warn!(vector = ?self.last_interrupt, "illegal unhandled interrupt called");
                Ok(CallbackReturn::Next)
            }
            Handler::DosDefault => Ok(CallbackReturn::Next),
            Handler::Xms => self.xms_call(),
            Handler::Multiplex => self.xms_multiplex(),
            Handler::Int67 => self.int67(),
            Handler::Int4B => self.int4b(),
            Handler::VcpiPm => self.vcpi_pm(),
            Handler::V86Monitor => self.v86_monitor(),
            Handler::Native(f) => f(self),
        }
    }

    /// Calls the far procedure at `target` and returns once it executes `retf`.
    pub fn run_real_far(&mut self, target: RealPtr) -> Result<()> {
        let (old_cs, old_eip) = (self.cpu.cs.selector, self.cpu.eip);
        let stop = self.callbacks.real_pointer(self.callbacks.stop_id());
        self.cpu.push16(&mut self.mem, stop.segment);
        self.cpu.push16(&mut self.mem, stop.offset);
        self.cpu.set_real_seg(SegReg::Cs, target.segment);
        self.cpu.eip = u32::from(target.offset);
        let result = self.run_nested();
        self.cpu.set_real_seg(SegReg::Cs, old_cs);
        self.cpu.eip = old_eip;
        result
    }

    /// Invokes real-mode interrupt `vector` as if the guest had executed `INT vector`.
    pub fn run_real_int(&mut self, vector: u8) -> Result<()> {
        let (old_cs, old_eip) = (self.cpu.cs.selector, self.cpu.eip);
        let entry = self.callbacks.run_real_int_pointer(vector);
        self.cpu.set_real_seg(SegReg::Cs, entry.segment);
        self.cpu.eip = u32::from(entry.offset);
        let result = self.run_nested();
        self.cpu.set_real_seg(SegReg::Cs, old_cs);
        self.cpu.eip = old_eip;
        result
    }

    /// Lets pending interrupts run by executing the idle slot with interrupts enabled.
    pub fn idle(&mut self) -> Result<()> {
        let (old_cs, old_eip) = (self.cpu.cs.selector, self.cpu.eip);
        let old_if = self.cpu.flag(EFlags::IF);
        let idle = self.callbacks.real_pointer(self.callbacks.idle_id());
        self.cpu.set_flag(EFlags::IF, true);
        self.cpu.set_real_seg(SegReg::Cs, idle.segment);
        self.cpu.eip = u32::from(idle.offset);
        let result = self.run_nested();
        self.cpu.set_real_seg(SegReg::Cs, old_cs);
        self.cpu.eip = old_eip;
        self.cpu.set_flag(EFlags::IF, old_if);
        result
    }

    fn patch_frame_flag(&mut self, flag: EFlags, value: bool) {
        let at = self
            .cpu
            .ss
            .base
            .wrapping_add(u32::from(self.cpu.sp().wrapping_add(4)));
        let mut flags = self.mem.read_u16(at);
        if value {
            flags |= flag.bits() as u16;
        } else {
            flags &= !(flag.bits() as u16);
        }
        self.mem.write_u16(at, flags);
    }

    /// Sets ZF in the FLAGS image of the interrupt frame on the guest stack.
    pub fn set_zf(&mut self, value: bool) {
        self.patch_frame_flag(EFlags::ZF, value);
    }

    pub fn set_cf(&mut self, value: bool) {
        self.patch_frame_flag(EFlags::CF, value);
    }

    pub fn set_if(&mut self, value: bool) {
        self.patch_frame_flag(EFlags::IF, value);
    }

    pub fn port_in(&mut self, port: u16, size: u8) -> Result<u32> {
        if port == PORT_A20_FAST && size == 1 {
            let a20 = if self.mem.a20_enabled() { 2 } else { 0 };
            return Ok(u32::from((self.a20_latch & !2) | a20));
        }
        Ok(self.io.read(port, size))
    }

    pub fn port_out(&mut self, port: u16, size: u8, val: u32) -> Result<()> {
        if port == PORT_A20_FAST && size == 1 {
            if val & 1 != 0 {
                error!("guest requested a reset through port 92h");
                return Err(FatalError::ResetRequested);
            }
            self.a20_latch = (val as u8) & !2;
            self.mem.set_a20(val & 2 != 0);
            return Ok(());
        }
        self.io.write(port, size, val);
        Ok(())
    }

    /// Whether V86 code may access `size` bytes at `port` without trapping. Outside V86 mode
    /// every access is allowed. In V86 mode the TSS I/O permission bitmap decides.
    pub fn io_permitted(&mut self, port: u16, size: u8) -> bool {
        if !self.cpu.v86_mode() {
            return true;
        }
        let tss = self.cpu.tr;
        if tss.limit < 0x67 {
            return false;
        }
        let iomap = u32::from(self.mem.read_u16(tss.base + 0x66));
        (0..u32::from(size)).all(|i| {
            let p = u32::from(port) + i;
            let byte = iomap + p / 8;
            byte <= tss.limit && self.mem.read_u8(tss.base + byte) & (1 << (p % 8)) == 0
        })
    }

    /// Records the vector of a software interrupt the guest is about to take.
    pub fn note_interrupt(&mut self, vector: u8) {
        self.last_interrupt = Some(vector);
    }

    /// Frees every XMS block, returns the driver's callbacks and drops the UMB chain.
    pub fn shutdown_xms(&mut self) -> Result<()> {
        let Some(xms) = self.xms.take() else {
            return Ok(());
        };
        xms.shutdown(&mut self.mem, &mut self.callbacks, &mut self.dos)?;
        debug!("XMS shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{StubKind, CB_SEG};
    use crate::config::EmsMode;
    use std::cell::Cell;

    fn machine() -> Machine {
        Machine::new(MemoryConfig {
            memory_size_bytes: 4 * 1024 * 1024,
            ..MemoryConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn boot_state() {
        let m = machine();
        assert!(m.xms.is_some());
        assert!(m.ems.is_some());
        assert!(!m.cpu.v86_mode());
        assert_eq!(m.cpu.cs.selector, CB_SEG);
        assert_eq!(m.cpu.ss.selector, 0x0030);
    }

    #[test]
    fn run_real_far_returns_to_the_caller() {
        let mut m = machine();
        // mov ax,1234h; retf
        m.mem.write_bytes(0x7000, &[0xB8, 0x34, 0x12, 0xCB]);
        let (cs, ip, sp) = (m.cpu.cs.selector, m.cpu.eip, m.cpu.esp);
        m.run_real_far(RealPtr::new(0x0700, 0)).unwrap();
        assert_eq!(m.cpu.ax(), 0x1234);
        assert_eq!((m.cpu.cs.selector, m.cpu.eip, m.cpu.esp), (cs, ip, sp));
    }

    #[test]
    fn run_real_int_reaches_a_native_handler() {
        let mut m = machine();
        let hits = Rc::new(Cell::new(0));
        let seen = Rc::clone(&hits);
        let handler = Handler::Native(Rc::new(move |m: &mut Machine| {
            seen.set(seen.get() + 1);
            m.cpu.set_bx(0xBEEF);
            m.set_cf(true);
            Ok(CallbackReturn::Next)
        }));
        let mut obj =
            HandlerObject::install(&mut m.callbacks, &mut m.mem, handler, StubKind::Iret, "test int 60").unwrap();
        obj.set_real_vec(&mut m.mem, 0x60);

        m.run_real_int(0x60).unwrap();
        assert_eq!(hits.get(), 1);
        assert_eq!(m.cpu.bx(), 0xBEEF);
        assert!(m.cpu.carry());
        assert_eq!(m.last_interrupt, Some(0x60));
    }

    #[test]
    fn runaway_guest_is_fatal() {
        let mut m = Machine::new(MemoryConfig {
            memory_size_bytes: 4 * 1024 * 1024,
            run_step_limit: 1000,
            ..MemoryConfig::default()
        })
        .unwrap();
        // jmp $
        m.mem.write_bytes(0x7000, &[0xEB, 0xFE]);
        assert!(matches!(
            m.run_real_far(RealPtr::new(0x0700, 0)),
            Err(FatalError::RunawayGuest { steps: 1000 })
        ));
    }

    #[test]
    fn idle_restores_the_interrupt_flag() {
        let mut m = machine();
        m.cpu.set_flag(EFlags::IF, false);
        m.idle().unwrap();
        assert!(!m.cpu.flag(EFlags::IF));
        assert_eq!(m.last_callback(), Some(m.callbacks.idle_id()));
    }

    #[test]
    fn illegal_callback_is_fatal() {
        let mut m = machine();
        assert!(matches!(
            m.dispatch_callback(100),
            Err(FatalError::IllegalCallback(100))
        ));
    }

    #[test]
    fn port_92_drives_the_a20_gate() {
        let mut m = machine();
        m.port_out(PORT_A20_FAST, 1, 0).unwrap();
        assert!(!m.mem.a20_enabled());
        assert_eq!(m.port_in(PORT_A20_FAST, 1).unwrap(), 0);
        m.port_out(PORT_A20_FAST, 1, 2).unwrap();
        assert!(m.mem.a20_enabled());
        assert_eq!(m.port_in(PORT_A20_FAST, 1).unwrap(), 2);
        assert!(matches!(
            m.port_out(PORT_A20_FAST, 1, 1),
            Err(FatalError::ResetRequested)
        ));
    }

    #[test]
    fn v86_startup_takes_the_cpu_into_v86_mode() {
        let mut m = Machine::new(MemoryConfig {
            memory_size_bytes: 4 * 1024 * 1024,
            v86_startup: true,
            ..MemoryConfig::default()
        })
        .unwrap();
        assert!(m.cpu.v86_mode());
        assert!(m.io_permitted(0x60, 1));
        assert!(!m.io_permitted(PORT_A20_FAST, 1));
        m.shutdown_ems().unwrap();
        assert!(!m.cpu.v86_mode());
    }

    #[test]
    fn board_mode_has_no_vcpi() {
        let m = Machine::new(MemoryConfig {
            memory_size_bytes: 4 * 1024 * 1024,
            ems: EmsMode::Board,
            v86_startup: true,
            ..MemoryConfig::default()
        })
        .unwrap();
        assert!(m.ems.as_ref().unwrap().vcpi().is_none());
        assert!(!m.cpu.v86_mode());
    }
}

//! Guest code emitted for callback slots.
//!
//! Every stub optionally starts (or, for the keyboard and mouse kinds, continues) with the
//! 4-byte trap `FE 38 id_lo id_hi` that hands control to the native handler, followed by the
//! real-mode instructions that finish the interrupt: acknowledging the PIC, chaining to a BIOS
//! hook, returning with the right frame size.

use crate::error::{FatalError, Result};

/// First two bytes of the callback trap instruction.
pub const TRAP_OPCODE: [u8; 2] = [0xFE, 0x38];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StubKind {
    Retn = 0,
    Retf,
    Retf8,
    Iret,
    Iretd,
    IretSti,
    IretEoiPic1,
    IretEoiPic2,
    Irq0,
    Irq0Pc98,
    Irq1,
    Irq1Pc98,
    Irq9,
    Irq12,
    Irq12Ret,
    Irq6Pcjr,
    Mouse,
    Int16,
    Int29,
    Hookable,
    TdeIret,
    Int21,
}

impl StubKind {
    pub const ALL: [StubKind; 22] = [
        StubKind::Retn,
        StubKind::Retf,
        StubKind::Retf8,
        StubKind::Iret,
        StubKind::Iretd,
        StubKind::IretSti,
        StubKind::IretEoiPic1,
        StubKind::IretEoiPic2,
        StubKind::Irq0,
        StubKind::Irq0Pc98,
        StubKind::Irq1,
        StubKind::Irq1Pc98,
        StubKind::Irq9,
        StubKind::Irq12,
        StubKind::Irq12Ret,
        StubKind::Irq6Pcjr,
        StubKind::Mouse,
        StubKind::Int16,
        StubKind::Int29,
        StubKind::Hookable,
        StubKind::TdeIret,
        StubKind::Int21,
    ];

    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            StubKind::Retn => "RETN",
            StubKind::Retf => "RETF",
            StubKind::Retf8 => "RETF8",
            StubKind::Iret => "IRET",
            StubKind::Iretd => "IRETD",
            StubKind::IretSti => "IRET_STI",
            StubKind::IretEoiPic1 => "IRET_EOI_PIC1",
            StubKind::IretEoiPic2 => "IRET_EOI_PIC2",
            StubKind::Irq0 => "IRQ0",
            StubKind::Irq0Pc98 => "IRQ0_PC98",
            StubKind::Irq1 => "IRQ1",
            StubKind::Irq1Pc98 => "IRQ1_PC98",
            StubKind::Irq9 => "IRQ9",
            StubKind::Irq12 => "IRQ12",
            StubKind::Irq12Ret => "IRQ12_RET",
            StubKind::Irq6Pcjr => "IRQ6_PCJR",
            StubKind::Mouse => "MOUSE",
            StubKind::Int16 => "INT16",
            StubKind::Int29 => "INT29",
            StubKind::Hookable => "HOOKABLE",
            StubKind::TdeIret => "TDE_IRET",
            StubKind::Int21 => "INT21",
        }
    }
}

/// Small byte sink that knows how to emit the trap for one callback.
struct Emitter {
    id: u16,
    use_cb: bool,
    code: Vec<u8>,
}

impl Emitter {
    fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    fn trap(&mut self) -> &mut Self {
        if self.use_cb {
            let [lo, hi] = self.id.to_le_bytes();
            self.code
                .extend_from_slice(&[TRAP_OPCODE[0], TRAP_OPCODE[1], lo, hi]);
        }
        self
    }

    /// NOP-pads up to `offset`.
    fn pad_to(&mut self, offset: usize) -> &mut Self {
        while self.code.len() < offset {
            self.code.push(0x90);
        }
        self
    }
}

/// Builds the code for callback `id`. With `use_cb == false` the trap is left out and the stub
/// only performs its guest-side work.
pub fn build_stub(id: u16, kind: StubKind, use_cb: bool) -> Result<Vec<u8>> {
    let mut e = Emitter {
        id,
        use_cb,
        code: Vec::with_capacity(24),
    };
    match kind {
        StubKind::Retn => {
            e.trap().bytes(&[0xC3]);
        }
        StubKind::Retf => {
            e.trap().bytes(&[0xCB]);
        }
        StubKind::Retf8 => {
            e.trap().bytes(&[0xCA, 0x08, 0x00]);
        }
        StubKind::Iret => {
            e.trap().bytes(&[0xCF]);
        }
        StubKind::Iretd => {
            e.trap().bytes(&[0x66, 0xCF]);
        }
        StubKind::IretSti => {
            e.bytes(&[0xFB]).trap().bytes(&[0xCF]);
        }
        StubKind::IretEoiPic1 => {
            // push ax; mov al,20h; out 20h,al; pop ax; iret
            e.trap()
                .bytes(&[0x50, 0xB0, 0x20, 0xE6, 0x20, 0x58, 0xCF]);
        }
        StubKind::IretEoiPic2 => {
            // push ax; mov al,20h; out 0A0h,al; out 20h,al; pop ax; iret
            e.trap()
                .bytes(&[0x50, 0xB0, 0x20, 0xE6, 0xA0, 0xE6, 0x20, 0x58, 0xCF]);
        }
        StubKind::Irq0 | StubKind::Irq0Pc98 => {
            let pic = if kind == StubKind::Irq0Pc98 { 0x00 } else { 0x20 };
            // push ax; push dx; push ds; int 1Ch; cli; pop ds; pop dx; EOI; pop ax; iret
            e.trap().bytes(&[
                0x50, 0x52, 0x1E, 0xCD, 0x1C, 0xFA, 0x1F, 0x5A, 0xB0, 0x20, 0xE6, pic, 0x58, 0xCF,
            ]);
        }
        StubKind::Irq1 | StubKind::Irq1Pc98 => {
            let (data, pic) = if kind == StubKind::Irq1Pc98 {
                (0x41, 0x00)
            } else {
                (0x60, 0x20)
            };
            // push ax; in al,data; mov ah,4Fh; stc; int 15h
            e.bytes(&[0x50, 0xE4, data, 0xB4, 0x4F, 0xF9, 0xCD, 0x15]);
            if use_cb {
                // jnc skip; <trap>
                e.bytes(&[0x73, 0x04]).trap();
            }
            e.bytes(&[0xFA, 0xB0, 0x20, 0xE6, pic, 0x58, 0xCF]);
        }
        StubKind::Irq9 => {
            // push ax; mov al,61h; out 0A0h,al; int 0Ah; cli; pop ax; iret
            e.trap()
                .bytes(&[0x50, 0xB0, 0x61, 0xE6, 0xA0, 0xCD, 0x0A, 0xFA, 0x58, 0xCF]);
        }
        StubKind::Irq12 => {
            if !use_cb {
                tracing::error!("IRQ12 callback stub requires a handler");
                return Err(FatalError::IllegalStubKind("IRQ12 without callback"));
            }
            // push ds; push es; pushad; cld; sti; <trap>
            e.bytes(&[0x1E, 0x06, 0x66, 0x60, 0xFC, 0xFB]).trap();
        }
        StubKind::Irq12Ret => {
            // cli; EOI slave and master; popad; pop es; pop ds; iret
            e.trap().bytes(&[
                0xFA, 0xB0, 0x20, 0xE6, 0xA0, 0xE6, 0x20, 0x66, 0x61, 0x07, 0x1F, 0xCF,
            ]);
        }
        StubKind::Irq6Pcjr => {
            // push ax; in al,60h; cmp al,0E0h
            e.bytes(&[0x50, 0xE4, 0x60, 0x3C, 0xE0]);
            if use_cb {
                e.bytes(&[0x74, 0x06]).trap();
            } else {
                e.bytes(&[0x74, 0x02]);
            }
            // int 09h; cli; EOI; pop ax; iret
            e.bytes(&[0xCD, 0x09, 0xFA, 0xB0, 0x20, 0xE6, 0x20, 0x58, 0xCF]);
        }
        StubKind::Mouse => {
            // jmp short over the hook area
            e.bytes(&[0xEB, 0x07]).pad_to(9).trap().bytes(&[0xCF]);
        }
        StubKind::Int16 => {
            // sti; <trap>; iret; then a spin that re-enters at the trap until a key arrives.
            e.bytes(&[0xFB]).trap().bytes(&[0xCF]);
            if use_cb {
                e.pad_to(0x0E).bytes(&[0xEB, 0xF1]);
            } else {
                e.pad_to(0x0A).bytes(&[0xEB, 0xF4]);
            }
        }
        StubKind::Int29 => {
            // push ax; mov ah,0Eh; int 10h; pop ax; iret
            e.trap()
                .bytes(&[0x50, 0xB4, 0x0E, 0xCD, 0x10, 0x58, 0xCF]);
        }
        StubKind::Hookable => {
            // jmp short +3 over a patchable far-jump area, then the trap and retf
            e.bytes(&[0xEB, 0x03, 0x90, 0x90, 0x90])
                .trap()
                .bytes(&[0xCB]);
        }
        StubKind::TdeIret => {
            // push ax; mov ax,91FBh; int 15h; cli; EOI; pop ax; iret
            e.trap().bytes(&[
                0x50, 0xB8, 0xFB, 0x91, 0xCD, 0x15, 0xFA, 0xB0, 0x20, 0xE6, 0x20, 0x58, 0xCF,
            ]);
        }
        StubKind::Int21 => {
            // sti; <trap>; iret; retf; then the CP/M-style delay loop entry
            e.bytes(&[0xFB]).trap().bytes(&[
                0xCF, 0xCB, 0x51, 0xB9, 0x40, 0x01, 0xE2, 0xFE, 0x59, 0xCF,
            ]);
        }
    }
    Ok(e.code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn len(kind: StubKind, use_cb: bool) -> usize {
        build_stub(5, kind, use_cb).unwrap().len()
    }

    #[test]
    fn stub_lengths_match_the_slot_layout() {
        let table = [
            (StubKind::Retn, 5, 1),
            (StubKind::Retf, 5, 1),
            (StubKind::Retf8, 7, 3),
            (StubKind::Iret, 5, 1),
            (StubKind::Iretd, 6, 2),
            (StubKind::IretSti, 6, 2),
            (StubKind::IretEoiPic1, 0x0B, 0x07),
            (StubKind::IretEoiPic2, 0x0D, 0x09),
            (StubKind::Irq0, 0x12, 0x0E),
            (StubKind::Irq0Pc98, 0x12, 0x0E),
            (StubKind::Irq1, 0x15, 0x0F),
            (StubKind::Irq1Pc98, 0x15, 0x0F),
            (StubKind::Irq9, 0x0E, 0x0A),
            (StubKind::Irq12Ret, 0x10, 0x0C),
            (StubKind::Irq6Pcjr, 0x14, 0x10),
            (StubKind::Mouse, 0x0E, 0x0A),
            (StubKind::Int16, 0x10, 0x0C),
            (StubKind::Int29, 0x0B, 0x07),
            (StubKind::Hookable, 0x0A, 0x06),
            (StubKind::TdeIret, 0x11, 0x0D),
            (StubKind::Int21, 0x0F, 0x0B),
        ];
        for (kind, with_cb, without_cb) in table {
            assert_eq!(len(kind, true), with_cb, "{}", kind.name());
            assert_eq!(len(kind, false), without_cb, "{}", kind.name());
        }
        assert_eq!(len(StubKind::Irq12, true), 0x0A);
    }

    #[test]
    fn irq12_needs_a_handler() {
        assert!(matches!(
            build_stub(1, StubKind::Irq12, false),
            Err(FatalError::IllegalStubKind(_))
        ));
    }

    #[test]
    fn trap_encodes_the_callback_number() {
        let code = build_stub(0x0123, StubKind::Iret, true).unwrap();
        assert_eq!(code, vec![0xFE, 0x38, 0x23, 0x01, 0xCF]);

        let code = build_stub(7, StubKind::IretSti, true).unwrap();
        assert_eq!(code, vec![0xFB, 0xFE, 0x38, 0x07, 0x00, 0xCF]);
    }

    #[test]
    fn int16_loop_jumps_back_to_the_trap() {
        let code = build_stub(3, StubKind::Int16, true).unwrap();
        // The jump at 0x0E lands on offset 1, the trap.
        let target = 0x10i32 + i32::from(code[0x0F] as i8);
        assert_eq!(target, 1);
        assert_eq!(&code[1..3], &TRAP_OPCODE);

        let code = build_stub(3, StubKind::Int16, false).unwrap();
        let target = 0x0Ci32 + i32::from(code[0x0B] as i8);
        assert_eq!(target, 0);
    }

    #[test]
    fn pc98_variants_use_pc98_ports() {
        let code = build_stub(2, StubKind::Irq1Pc98, false).unwrap();
        assert_eq!(&code[1..3], &[0xE4, 0x41]);
        assert_eq!(code[code.len() - 3], 0x00);
        let code = build_stub(2, StubKind::Irq0Pc98, false).unwrap();
        assert_eq!(&code[10..12], &[0xE6, 0x00]);
    }

    #[test]
    fn kinds_round_trip_through_their_tag() {
        for kind in StubKind::ALL {
            assert_eq!(StubKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(StubKind::from_u8(200), None);
    }
}

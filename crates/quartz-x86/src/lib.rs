//! x86 architectural vocabulary shared between the CPU core and the decoder.
//!
//! The decoder is a separate component; the core consumes instructions that
//! already carry their resolved operation tag ([`InsnKind`]) so dispatch is a
//! plain `match` with no per-opcode table lookup at execution time. This crate
//! owns the operand model (registers, widths, memory forms) and the
//! fetch-legality mask the core publishes back to the decoder.

use core::fmt;

use bitflags::bitflags;

/// Operand width. x86 operand sizes are one of these four; partial-width
/// register writes follow the aliasing rules implemented by the CPU state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    #[must_use]
    pub fn bytes(self) -> u64 {
        (self.bits() / 8) as u64
    }

    #[must_use]
    pub fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
            Width::W64 => u64::MAX,
        }
    }

    #[must_use]
    pub fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    /// The width holding twice as many bits, used by widening multiplies and
    /// mask unpacks. Doubling the top width is an internal error.
    #[must_use]
    pub fn doubled(self) -> Width {
        match self {
            Width::W8 => Width::W16,
            Width::W16 => Width::W32,
            Width::W32 => Width::W64,
            Width::W64 => panic!("no width above 64 bits"),
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// General-purpose register identifier. The value is the architectural
/// register number (REX.B/R/X extensions included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    #[must_use]
    pub fn from_u4(code: u8) -> Option<Gpr> {
        Some(match code {
            0 => Gpr::Rax,
            1 => Gpr::Rcx,
            2 => Gpr::Rdx,
            3 => Gpr::Rbx,
            4 => Gpr::Rsp,
            5 => Gpr::Rbp,
            6 => Gpr::Rsi,
            7 => Gpr::Rdi,
            8 => Gpr::R8,
            9 => Gpr::R9,
            10 => Gpr::R10,
            11 => Gpr::R11,
            12 => Gpr::R12,
            13 => Gpr::R13,
            14 => Gpr::R14,
            15 => Gpr::R15,
            _ => return None,
        })
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Only the first four registers have a legacy high-byte alias (AH/CH/
    /// DH/BH), and only when no REX prefix was present on the instruction.
    #[must_use]
    pub fn has_high8(self) -> bool {
        (self as u8) < 4
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(s)
    }
}

/// Opmask (AVX-512 `k0`..`k7`) register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Kreg(pub u8);

impl Kreg {
    #[must_use]
    pub fn index(self) -> usize {
        debug_assert!(self.0 < 8, "opmask register out of range");
        self.0 as usize
    }
}

impl fmt::Display for Kreg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", self.0)
    }
}

/// Segment register identifier, in descriptor-table encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Seg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl fmt::Display for Seg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Seg::Es => "es",
            Seg::Cs => "cs",
            Seg::Ss => "ss",
            Seg::Ds => "ds",
            Seg::Fs => "fs",
            Seg::Gs => "gs",
        };
        f.write_str(s)
    }
}

/// A register operand as it appeared in the encoding: which register, at
/// which width, and whether the 8-bit form addresses the legacy high byte.
///
/// `high8` can only be true for the first four registers and only when the
/// instruction carried no REX prefix; the decoder resolves that rule (a REX
/// prefix turns encodings 4..=7 into SPL/BPL/SIL/DIL instead of AH..BH), the
/// state layer only honors the resolved flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg {
    pub gpr: Gpr,
    pub width: Width,
    pub high8: bool,
}

impl Reg {
    #[must_use]
    pub fn new(gpr: Gpr, width: Width) -> Self {
        Self {
            gpr,
            width,
            high8: false,
        }
    }

    #[must_use]
    pub fn high(gpr: Gpr) -> Self {
        debug_assert!(gpr.has_high8());
        Self {
            gpr,
            width: Width::W8,
            high8: true,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.width == Width::W8 && self.high8 {
            let s = match self.gpr {
                Gpr::Rax => "ah",
                Gpr::Rcx => "ch",
                Gpr::Rdx => "dh",
                Gpr::Rbx => "bh",
                _ => "??",
            };
            return f.write_str(s);
        }
        match self.width {
            Width::W8 => {
                let s = match self.gpr {
                    Gpr::Rax => "al",
                    Gpr::Rcx => "cl",
                    Gpr::Rdx => "dl",
                    Gpr::Rbx => "bl",
                    Gpr::Rsp => "spl",
                    Gpr::Rbp => "bpl",
                    Gpr::Rsi => "sil",
                    Gpr::Rdi => "dil",
                    Gpr::R8 => "r8b",
                    Gpr::R9 => "r9b",
                    Gpr::R10 => "r10b",
                    Gpr::R11 => "r11b",
                    Gpr::R12 => "r12b",
                    Gpr::R13 => "r13b",
                    Gpr::R14 => "r14b",
                    Gpr::R15 => "r15b",
                };
                f.write_str(s)
            }
            Width::W16 => match self.gpr {
                Gpr::Rax => f.write_str("ax"),
                Gpr::Rcx => f.write_str("cx"),
                Gpr::Rdx => f.write_str("dx"),
                Gpr::Rbx => f.write_str("bx"),
                Gpr::Rsp => f.write_str("sp"),
                Gpr::Rbp => f.write_str("bp"),
                Gpr::Rsi => f.write_str("si"),
                Gpr::Rdi => f.write_str("di"),
                g => write!(f, "{g}w"),
            },
            Width::W32 => match self.gpr {
                Gpr::Rax => f.write_str("eax"),
                Gpr::Rcx => f.write_str("ecx"),
                Gpr::Rdx => f.write_str("edx"),
                Gpr::Rbx => f.write_str("ebx"),
                Gpr::Rsp => f.write_str("esp"),
                Gpr::Rbp => f.write_str("ebp"),
                Gpr::Rsi => f.write_str("esi"),
                Gpr::Rdi => f.write_str("edi"),
                g => write!(f, "{g}d"),
            },
            Width::W64 => write!(f, "{}", self.gpr),
        }
    }
}

/// A memory operand. The effective address is `seg.base + base + index*scale
/// + disp`, truncated to the address width the execution layer derives from
/// the current mode. RIP-relative forms are resolved into `disp` by the
/// decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    pub seg: Seg,
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: u8,
    pub disp: i64,
}

impl Addr {
    /// Absolute displacement-only form, the common shape in tests.
    #[must_use]
    pub fn abs(seg: Seg, disp: u64) -> Self {
        Self {
            seg,
            base: None,
            index: None,
            scale: 1,
            disp: disp as i64,
        }
    }
}

/// One instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(u64),
    Mem(Addr),
}

/// Condition codes for `Jcc`, matching the low nibble of the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

/// Two-operand ALU operations sharing one handler shape. `Cmp` and `Test`
/// are the non-writing forms of `Sub` and `And`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    And,
    Or,
    Xor,
    Test,
}

/// Bitwise opmask operations sharing the three-register handler shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KBinOp {
    And,
    Andn,
    Or,
    Xor,
    Xnor,
    Add,
}

/// The resolved operation of one decoded instruction.
///
/// Each variant is an instruction family with its operands already picked
/// apart; the core dispatches over this tag with a single `match`. Register
/// and memory forms of `KMOV` stay distinct variants because their handler
/// bodies share almost nothing; the general-purpose families fold the form
/// into [`Operand`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    Alu {
        op: AluOp,
        dst: Operand,
        src: Operand,
        width: Width,
    },
    Inc {
        dst: Operand,
        width: Width,
    },
    Dec {
        dst: Operand,
        width: Width,
    },
    Neg {
        dst: Operand,
        width: Width,
    },
    Not {
        dst: Operand,
        width: Width,
    },
    Mov {
        dst: Operand,
        src: Operand,
        width: Width,
    },
    Movzx {
        dst: Reg,
        src: Operand,
        src_width: Width,
    },
    Movsx {
        dst: Reg,
        src: Operand,
        src_width: Width,
    },
    Xchg {
        a: Operand,
        b: Operand,
        width: Width,
    },
    /// Unsigned widening multiply by the accumulator (`MUL r/m`).
    Mul {
        src: Operand,
        width: Width,
    },
    /// Signed widening multiply by the accumulator (`IMUL r/m`).
    Imul1 {
        src: Operand,
        width: Width,
    },
    /// Two-operand truncating signed multiply (`IMUL r, r/m`).
    Imul2 {
        dst: Reg,
        src: Operand,
        width: Width,
    },
    /// Immediate-form truncating signed multiply (`IMUL r, r/m, imm`).
    Imul3 {
        dst: Reg,
        src: Operand,
        imm: u64,
        width: Width,
    },
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,
    Lahf,
    Sahf,
    Pushf {
        width: Width,
    },
    Popf {
        width: Width,
    },
    JmpRel {
        target: u64,
    },
    Jcc {
        cond: Cond,
        target: u64,
    },
    CallRel {
        target: u64,
    },
    RetNear {
        pop: u16,
    },
    Nop,
    Hlt,
    Int {
        vector: u8,
    },
    Int3,
    Into,
    Int1,
    Iret {
        width: Width,
    },
    Ud2,
    KBin {
        op: KBinOp,
        dst: Kreg,
        src1: Kreg,
        src2: Kreg,
        width: Width,
    },
    Knot {
        dst: Kreg,
        src: Kreg,
        width: Width,
    },
    Kshiftl {
        dst: Kreg,
        src: Kreg,
        count: u8,
        width: Width,
    },
    Kshiftr {
        dst: Kreg,
        src: Kreg,
        count: u8,
        width: Width,
    },
    /// Concatenates two half-width masks; `src2` lands in the low half.
    Kunpck {
        dst: Kreg,
        src1: Kreg,
        src2: Kreg,
        half: Width,
    },
    Kortest {
        src1: Kreg,
        src2: Kreg,
        width: Width,
    },
    Ktest {
        src1: Kreg,
        src2: Kreg,
        width: Width,
    },
    KmovRR {
        dst: Kreg,
        src: Kreg,
        width: Width,
    },
    KmovLoad {
        dst: Kreg,
        addr: Addr,
        width: Width,
    },
    KmovStore {
        addr: Addr,
        src: Kreg,
        width: Width,
    },
    KmovFromGpr {
        dst: Kreg,
        src: Gpr,
        width: Width,
    },
    KmovToGpr {
        dst: Gpr,
        src: Kreg,
        width: Width,
    },
}

impl InsnKind {
    /// True for the opmask family, which is fetch-gated on the mask
    /// extension being architecturally enabled.
    #[must_use]
    pub fn is_opmask(&self) -> bool {
        matches!(
            self,
            InsnKind::KBin { .. }
                | InsnKind::Knot { .. }
                | InsnKind::Kshiftl { .. }
                | InsnKind::Kshiftr { .. }
                | InsnKind::Kunpck { .. }
                | InsnKind::Kortest { .. }
                | InsnKind::Ktest { .. }
                | InsnKind::KmovRR { .. }
                | InsnKind::KmovLoad { .. }
                | InsnKind::KmovStore { .. }
                | InsnKind::KmovFromGpr { .. }
                | InsnKind::KmovToGpr { .. }
        )
    }
}

/// One decoded instruction: the resolved operation plus its encoded length.
///
/// Produced by the decoder, consumed exactly once by the dispatch engine.
/// The engine advances the instruction pointer by `len` before invoking the
/// handler, so control-transfer handlers just overwrite the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInsn {
    pub kind: InsnKind,
    pub len: u8,
}

impl DecodedInsn {
    #[must_use]
    pub fn new(kind: InsnKind, len: u8) -> Self {
        Self { kind, len }
    }
}

/// Decode failure reported by the decoder component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// No legal instruction at this position under the current fetch mask.
    Undefined,
    /// The fetch window ended before the instruction did.
    FetchLimit,
}

bitflags! {
    /// Legality summary the core publishes to the decoder after every mode
    /// or extension-enable change. The decoder rejects encodings that are
    /// illegal under the current mask before they ever reach dispatch, and
    /// keys any decode cache it maintains on the whole mask value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FetchMask: u32 {
        /// Code segment defaults to 32-bit operand/address size.
        const D32 = 1 << 0;
        /// 64-bit submode is active.
        const LONG64 = 1 << 1;
        /// SSE instructions are executable.
        const SSE_OK = 1 << 2;
        /// VEX-encoded AVX instructions are executable.
        const AVX_OK = 1 << 3;
        /// Opmask (`k`-register) instructions are executable.
        const OPMASK_OK = 1 << 4;
        /// EVEX-encoded wide-SIMD instructions are executable.
        const EVEX_OK = 1 << 5;
    }
}

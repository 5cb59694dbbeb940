//! CPU execution mode derivation.
//!
//! The active mode is a pure function of four bits: CR0.PE, RFLAGS.VM,
//! EFER.LMA, and the code segment's long attribute. It is cached in
//! `CpuState` and recomputed by `CpuState::update_mode` whenever one of the
//! inputs changes; nothing derives it implicitly on read. Combinations the
//! architecture forbids (VM86 inside long mode, long mode without
//! protection) cannot be reached because the flag and control-register write
//! paths refuse the offending bit changes, but the derivation is still total
//! over all sixteen input combinations.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuMode {
    #[default]
    Real,
    Virtual8086,
    Protected,
    LongCompat,
    Long64,
}

impl CpuMode {
    #[must_use]
    pub fn derive(pe: bool, vm: bool, lma: bool, cs_long: bool) -> CpuMode {
        if lma {
            if cs_long {
                CpuMode::Long64
            } else {
                CpuMode::LongCompat
            }
        } else if !pe {
            CpuMode::Real
        } else if vm {
            CpuMode::Virtual8086
        } else {
            CpuMode::Protected
        }
    }

    #[must_use]
    pub fn is_long64(self) -> bool {
        self == CpuMode::Long64
    }

    /// Either long submode; EFER.LMA is set in both.
    #[must_use]
    pub fn is_long(self) -> bool {
        matches!(self, CpuMode::LongCompat | CpuMode::Long64)
    }

    #[must_use]
    pub fn is_protected(self) -> bool {
        matches!(
            self,
            CpuMode::Protected | CpuMode::LongCompat | CpuMode::Long64
        )
    }

    /// Instruction-pointer truncation mask. Outside Long64 the architectural
    /// IP is at most 32 bits wide; the 16-bit (real/VM86) case is further
    /// narrowed by the code segment limit, which the fetch path checks.
    #[must_use]
    pub fn ip_mask(self) -> u64 {
        match self {
            CpuMode::Long64 => u64::MAX,
            CpuMode::Real | CpuMode::Virtual8086 => 0xFFFF,
            CpuMode::Protected | CpuMode::LongCompat => 0xFFFF_FFFF,
        }
    }
}

impl fmt::Display for CpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CpuMode::Real => "real",
            CpuMode::Virtual8086 => "vm86",
            CpuMode::Protected => "protected",
            CpuMode::LongCompat => "compat",
            CpuMode::Long64 => "long64",
        };
        f.write_str(s)
    }
}

//! RFLAGS storage with lazily evaluated arithmetic flags.
//!
//! Control flags (TF, IF, DF, ...) live eagerly in the raw word. The six
//! arithmetic status flags (OF, SF, ZF, AF, PF, CF) are governed by a shadow
//! record of the last arithmetic operation; reading any of them materializes
//! the whole group into the raw word first. Every arithmetic instruction
//! replaces the shadow, every direct write to the flags word materializes and
//! then overwrites, so the raw word and the shadow never disagree about who
//! owns the status bits.
//!
//! This type is pure storage: the flag writes that have architectural side
//! effects (TF arming the async-event check, IF regating external
//! interrupts, RF invalidating prefetch, AC re-deriving alignment checking,
//! VM switching mode) are exposed on `CpuState`, which owns the state those
//! effects touch.

use quartz_x86::Width;

pub const RFLAGS_CF: u64 = 1 << 0;
pub const RFLAGS_PF: u64 = 1 << 2;
pub const RFLAGS_AF: u64 = 1 << 4;
pub const RFLAGS_ZF: u64 = 1 << 6;
pub const RFLAGS_SF: u64 = 1 << 7;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;
pub const RFLAGS_OF: u64 = 1 << 11;
pub const RFLAGS_IOPL: u64 = 3 << 12;
pub const RFLAGS_NT: u64 = 1 << 14;
pub const RFLAGS_RF: u64 = 1 << 16;
pub const RFLAGS_VM: u64 = 1 << 17;
pub const RFLAGS_AC: u64 = 1 << 18;
pub const RFLAGS_VIF: u64 = 1 << 19;
pub const RFLAGS_VIP: u64 = 1 << 20;
pub const RFLAGS_ID: u64 = 1 << 21;

pub const RFLAGS_OSZAPC: u64 =
    RFLAGS_OF | RFLAGS_SF | RFLAGS_ZF | RFLAGS_AF | RFLAGS_PF | RFLAGS_CF;

/// Bit 1 always reads as one; bits 3, 5, 15 and everything above bit 21
/// always read as zero.
const RFLAGS_ALWAYS_SET: u64 = 1 << 1;
/// Every architecturally defined flag bit. Writes outside this mask are
/// dropped; reads outside it return zero (bit 1 aside).
pub const RFLAGS_DEFINED: u64 = 0x003F_7FD7 | RFLAGS_ALWAYS_SET;

/// Shadow record of the last status-flag-producing operation. Operands and
/// result are stored unmasked; materialization truncates to `width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyFlags {
    Add {
        lhs: u64,
        rhs: u64,
        width: Width,
        result: u64,
    },
    /// Add-with-carry; `carry_in` changes only the CF rule.
    Adc {
        lhs: u64,
        rhs: u64,
        carry_in: bool,
        width: Width,
        result: u64,
    },
    Sub {
        lhs: u64,
        rhs: u64,
        width: Width,
        result: u64,
    },
    Sbb {
        lhs: u64,
        rhs: u64,
        carry_in: bool,
        width: Width,
        result: u64,
    },
    Logic {
        result: u64,
        width: Width,
    },
    /// INC/DEC: an add/sub of one that leaves CF untouched. The preserved
    /// carry is captured at execution time so later materialization does not
    /// depend on when the read happens.
    IncDec {
        dec: bool,
        lhs: u64,
        width: Width,
        result: u64,
        carry: bool,
    },
    /// Widening or truncating multiply: CF and OF report whether the upper
    /// half of the product is significant; SF/ZF/PF follow the low half and
    /// AF is cleared.
    Mul {
        low: u64,
        upper_significant: bool,
        width: Width,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rflags {
    raw: u64,
    lazy: Option<LazyFlags>,
}

impl Default for Rflags {
    fn default() -> Self {
        Self {
            raw: RFLAGS_ALWAYS_SET,
            lazy: None,
        }
    }
}

impl Rflags {
    /// Replaces the shadow with a new operation record. The stale status
    /// bits left in the raw word are dead until the next materialization.
    pub fn set_lazy(&mut self, lazy: LazyFlags) {
        self.lazy = Some(lazy);
    }

    /// Materializes any pending status bits into the raw word and returns
    /// the whole flags value. This is the only way the raw word is observed
    /// as a whole (stack pushes, LAHF, state save).
    pub fn read(&mut self) -> u64 {
        if let Some(lazy) = self.lazy.take() {
            let status = materialize(lazy);
            self.raw = (self.raw & !RFLAGS_OSZAPC) | status;
        }
        (self.raw & RFLAGS_DEFINED) | RFLAGS_ALWAYS_SET
    }

    /// Whole-word write. Reserved bits are forced to their fixed values and
    /// the shadow is discarded: the written status bits are now the truth.
    pub fn write(&mut self, value: u64) {
        self.raw = (value & RFLAGS_DEFINED) | RFLAGS_ALWAYS_SET;
        self.lazy = None;
    }

    /// Masked write: bits outside `change_mask` keep their current value.
    /// Used by POPF/IRET, whose writable set depends on mode and privilege.
    pub fn write_masked(&mut self, value: u64, change_mask: u64) {
        let old = self.read();
        self.write((old & !change_mask) | (value & change_mask));
    }

    /// Reads a control bit straight from the raw word. Callers must not use
    /// this for OF/SF/ZF/AF/PF/CF, which may be pending in the shadow.
    #[inline]
    fn control(&self, mask: u64) -> bool {
        debug_assert_eq!(mask & RFLAGS_OSZAPC, 0);
        self.raw & mask != 0
    }

    #[inline]
    fn set_control(&mut self, mask: u64, value: bool) {
        debug_assert_eq!(mask & RFLAGS_OSZAPC, 0);
        if value {
            self.raw |= mask;
        } else {
            self.raw &= !mask;
        }
    }

    /// Reads a status bit, materializing the group first.
    #[inline]
    fn status(&mut self, mask: u64) -> bool {
        self.read() & mask != 0
    }

    /// Overwrites one status bit. The group is materialized first so the
    /// other five survive the shadow being discarded.
    #[inline]
    fn set_status(&mut self, mask: u64, value: bool) {
        let old = self.read();
        self.write(if value { old | mask } else { old & !mask });
    }

    pub fn get_cf(&mut self) -> bool {
        self.status(RFLAGS_CF)
    }

    pub fn get_pf(&mut self) -> bool {
        self.status(RFLAGS_PF)
    }

    pub fn get_af(&mut self) -> bool {
        self.status(RFLAGS_AF)
    }

    pub fn get_zf(&mut self) -> bool {
        self.status(RFLAGS_ZF)
    }

    pub fn get_sf(&mut self) -> bool {
        self.status(RFLAGS_SF)
    }

    pub fn get_of(&mut self) -> bool {
        self.status(RFLAGS_OF)
    }

    pub fn cf_bit(&mut self) -> u64 {
        u64::from(self.get_cf())
    }

    pub fn set_cf(&mut self, value: bool) {
        self.set_status(RFLAGS_CF, value);
    }

    pub fn set_pf(&mut self, value: bool) {
        self.set_status(RFLAGS_PF, value);
    }

    pub fn set_af(&mut self, value: bool) {
        self.set_status(RFLAGS_AF, value);
    }

    pub fn set_zf(&mut self, value: bool) {
        self.set_status(RFLAGS_ZF, value);
    }

    pub fn set_sf(&mut self, value: bool) {
        self.set_status(RFLAGS_SF, value);
    }

    pub fn set_of(&mut self, value: bool) {
        self.set_status(RFLAGS_OF, value);
    }

    pub fn assert_cf(&mut self) {
        self.set_cf(true);
    }

    pub fn clear_cf(&mut self) {
        self.set_cf(false);
    }

    /// Clears OF/SF/AF/PF and writes CF and ZF in one materialization, the
    /// flag shape of the opmask test instructions.
    pub fn set_oszapc_test(&mut self, zf: bool, cf: bool) {
        let old = self.read();
        let mut value = old & !RFLAGS_OSZAPC;
        if zf {
            value |= RFLAGS_ZF;
        }
        if cf {
            value |= RFLAGS_CF;
        }
        self.write(value);
    }

    pub fn get_tf(&self) -> bool {
        self.control(RFLAGS_TF)
    }

    pub fn get_if(&self) -> bool {
        self.control(RFLAGS_IF)
    }

    pub fn get_df(&self) -> bool {
        self.control(RFLAGS_DF)
    }

    pub fn get_nt(&self) -> bool {
        self.control(RFLAGS_NT)
    }

    pub fn get_rf(&self) -> bool {
        self.control(RFLAGS_RF)
    }

    pub fn get_vm(&self) -> bool {
        self.control(RFLAGS_VM)
    }

    pub fn get_ac(&self) -> bool {
        self.control(RFLAGS_AC)
    }

    pub fn get_vif(&self) -> bool {
        self.control(RFLAGS_VIF)
    }

    pub fn get_vip(&self) -> bool {
        self.control(RFLAGS_VIP)
    }

    pub fn get_id(&self) -> bool {
        self.control(RFLAGS_ID)
    }

    pub fn set_df(&mut self, value: bool) {
        self.set_control(RFLAGS_DF, value);
    }

    pub fn set_nt(&mut self, value: bool) {
        self.set_control(RFLAGS_NT, value);
    }

    pub fn set_vif(&mut self, value: bool) {
        self.set_control(RFLAGS_VIF, value);
    }

    pub fn set_vip(&mut self, value: bool) {
        self.set_control(RFLAGS_VIP, value);
    }

    pub fn set_id(&mut self, value: bool) {
        self.set_control(RFLAGS_ID, value);
    }

    pub fn iopl(&self) -> u8 {
        ((self.raw & RFLAGS_IOPL) >> 12) as u8
    }

    pub fn set_iopl(&mut self, iopl: u8) {
        self.raw = (self.raw & !RFLAGS_IOPL) | (u64::from(iopl & 3) << 12);
    }

    /// Raw control-bit writes for the flags whose side effects `CpuState`
    /// coordinates. Keeping these crate-private stops handler code from
    /// skipping the side effects.
    pub(crate) fn set_tf_raw(&mut self, value: bool) {
        self.set_control(RFLAGS_TF, value);
    }

    pub(crate) fn set_if_raw(&mut self, value: bool) {
        self.set_control(RFLAGS_IF, value);
    }

    pub(crate) fn set_rf_raw(&mut self, value: bool) {
        self.set_control(RFLAGS_RF, value);
    }

    pub(crate) fn set_vm_raw(&mut self, value: bool) {
        self.set_control(RFLAGS_VM, value);
    }

    pub(crate) fn set_ac_raw(&mut self, value: bool) {
        self.set_control(RFLAGS_AC, value);
    }
}

fn parity8(x: u8) -> bool {
    x.count_ones() % 2 == 0
}

/// SF/ZF/PF of a width-truncated result, the part every operation class
/// shares.
fn szp(res: u64, width: Width) -> u64 {
    let mut flags = 0;
    if res == 0 {
        flags |= RFLAGS_ZF;
    }
    if res & width.sign_bit() != 0 {
        flags |= RFLAGS_SF;
    }
    if parity8(res as u8) {
        flags |= RFLAGS_PF;
    }
    flags
}

/// Pure computation of the six status bits from a shadow record. Idempotent:
/// the record is value-only, so recomputing cannot change the answer.
#[must_use]
pub fn materialize(lazy: LazyFlags) -> u64 {
    match lazy {
        LazyFlags::Add {
            lhs,
            rhs,
            width,
            result,
        } => compute_add_flags(lhs, rhs, false, width, result),
        LazyFlags::Adc {
            lhs,
            rhs,
            carry_in,
            width,
            result,
        } => compute_add_flags(lhs, rhs, carry_in, width, result),
        LazyFlags::Sub {
            lhs,
            rhs,
            width,
            result,
        } => compute_sub_flags(lhs, rhs, false, width, result),
        LazyFlags::Sbb {
            lhs,
            rhs,
            carry_in,
            width,
            result,
        } => compute_sub_flags(lhs, rhs, carry_in, width, result),
        LazyFlags::Logic { result, width } => szp(result & width.mask(), width),
        LazyFlags::IncDec {
            dec,
            lhs,
            width,
            result,
            carry,
        } => {
            let computed = if dec {
                compute_sub_flags(lhs, 1, false, width, result)
            } else {
                compute_add_flags(lhs, 1, false, width, result)
            };
            let mut flags = computed & !RFLAGS_CF;
            if carry {
                flags |= RFLAGS_CF;
            }
            flags
        }
        LazyFlags::Mul {
            low,
            upper_significant,
            width,
        } => {
            let mut flags = szp(low & width.mask(), width);
            if upper_significant {
                flags |= RFLAGS_CF | RFLAGS_OF;
            }
            flags
        }
    }
}

fn compute_add_flags(lhs: u64, rhs: u64, carry_in: bool, width: Width, result: u64) -> u64 {
    let mask = width.mask();
    let res = result & mask;
    let lhs = lhs & mask;
    let rhs = rhs & mask;
    let mut flags = szp(res, width);

    if (lhs as u128 + rhs as u128 + u128::from(carry_in)) > mask as u128 {
        flags |= RFLAGS_CF;
    }

    // AF: carry out of bit 3.
    if ((lhs ^ rhs ^ res) & 0x10) != 0 {
        flags |= RFLAGS_AF;
    }

    // OF: operands agree in sign, result disagrees.
    if (((!(lhs ^ rhs)) & (lhs ^ res)) & width.sign_bit()) != 0 {
        flags |= RFLAGS_OF;
    }

    flags
}

fn compute_sub_flags(lhs: u64, rhs: u64, borrow_in: bool, width: Width, result: u64) -> u64 {
    let mask = width.mask();
    let res = result & mask;
    let lhs = lhs & mask;
    let rhs = rhs & mask;
    let mut flags = szp(res, width);

    if (lhs as u128) < (rhs as u128 + u128::from(borrow_in)) {
        flags |= RFLAGS_CF;
    }

    if ((lhs ^ rhs ^ res) & 0x10) != 0 {
        flags |= RFLAGS_AF;
    }

    // OF: operands disagree in sign and the result took the subtrahend's.
    if (((lhs ^ rhs) & (lhs ^ res)) & width.sign_bit()) != 0 {
        flags |= RFLAGS_OF;
    }

    flags
}

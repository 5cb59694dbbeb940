//! Opmask (k-register) instructions.
//!
//! Every destination write replaces the whole 64-bit register with the
//! zero-extended width-sized result; only KORTEST and KTEST touch RFLAGS,
//! and no opmask instruction raises a fault of its own once decoded (the
//! execute gate rejects the family when the extension is off).

use quartz_x86::{Addr, Gpr, KBinOp, Kreg, Width};

use crate::exceptions::Fault;
use crate::mem::{self, CpuBus};
use crate::state::CpuState;

pub fn kbin(
    state: &mut CpuState,
    op: KBinOp,
    dst: Kreg,
    src1: Kreg,
    src2: Kreg,
    width: Width,
) -> Result<(), Fault> {
    let a = state.mask_read(src1, width);
    let b = state.mask_read(src2, width);
    let result = match op {
        KBinOp::And => a & b,
        KBinOp::Andn => !a & b,
        KBinOp::Or => a | b,
        KBinOp::Xor => a ^ b,
        KBinOp::Xnor => !(a ^ b),
        KBinOp::Add => a.wrapping_add(b),
    };
    state.mask_write(dst, width, result);
    Ok(())
}

pub fn knot(state: &mut CpuState, dst: Kreg, src: Kreg, width: Width) -> Result<(), Fault> {
    let value = state.mask_read(src, width);
    state.mask_write(dst, width, !value);
    Ok(())
}

/// Shift by an immediate count. Counts at or above the operand width clear
/// the destination rather than wrapping.
pub fn kshift(
    state: &mut CpuState,
    dst: Kreg,
    src: Kreg,
    count: u8,
    width: Width,
    left: bool,
) -> Result<(), Fault> {
    let value = state.mask_read(src, width);
    let result = if u32::from(count) >= width.bits() {
        0
    } else if left {
        value << count
    } else {
        value >> count
    };
    state.mask_write(dst, width, result);
    Ok(())
}

/// Concatenates the low `half` of each source into a result twice as wide:
/// `src1` supplies the upper half, `src2` the lower.
pub fn kunpck(
    state: &mut CpuState,
    dst: Kreg,
    src1: Kreg,
    src2: Kreg,
    half: Width,
) -> Result<(), Fault> {
    let hi = state.mask_read(src1, half);
    let lo = state.mask_read(src2, half);
    state.mask_write(dst, half.doubled(), hi << half.bits() | lo);
    Ok(())
}

/// ZF when the OR of the sources is all zeroes, CF when it is all ones;
/// the remaining arithmetic flags are cleared.
pub fn kortest(
    state: &mut CpuState,
    src1: Kreg,
    src2: Kreg,
    width: Width,
) -> Result<(), Fault> {
    let or = state.mask_read(src1, width) | state.mask_read(src2, width);
    state
        .rflags
        .set_oszapc_test(or == 0, or == width.mask());
    Ok(())
}

/// ZF when the sources share no set bit, CF when `src2` has no set bit
/// outside `src1`.
pub fn ktest(state: &mut CpuState, src1: Kreg, src2: Kreg, width: Width) -> Result<(), Fault> {
    let a = state.mask_read(src1, width);
    let b = state.mask_read(src2, width);
    state.rflags.set_oszapc_test(a & b == 0, !a & b == 0);
    Ok(())
}

pub fn kmov_rr(state: &mut CpuState, dst: Kreg, src: Kreg, width: Width) -> Result<(), Fault> {
    let value = state.mask_read(src, width);
    state.mask_write(dst, width, value);
    Ok(())
}

pub fn kmov_load(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: Kreg,
    addr: Addr,
    width: Width,
) -> Result<(), Fault> {
    let ea = mem::resolve_addr(state, &addr);
    let value = mem::read_mem(state, bus, addr.seg, ea, width)?;
    state.mask_write(dst, width, value);
    Ok(())
}

pub fn kmov_store(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    addr: Addr,
    src: Kreg,
    width: Width,
) -> Result<(), Fault> {
    let ea = mem::resolve_addr(state, &addr);
    let value = state.mask_read(src, width);
    mem::write_mem(state, bus, addr.seg, ea, width, value)
}

pub fn kmov_from_gpr(
    state: &mut CpuState,
    dst: Kreg,
    src: Gpr,
    width: Width,
) -> Result<(), Fault> {
    let value = state.read64(src.index());
    state.mask_write(dst, width, value);
    Ok(())
}

/// The general-register forms write a 32-bit destination (zeroing the upper
/// half) except for the quadword move.
pub fn kmov_to_gpr(
    state: &mut CpuState,
    dst: Gpr,
    src: Kreg,
    width: Width,
) -> Result<(), Fault> {
    let value = state.mask_read(src, width);
    if width == Width::W64 {
        state.write64(dst.index(), value);
    } else {
        state.write32(dst.index(), value as u32);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::state::CpuFeatures;
    use quartz_x86::Seg;

    fn setup() -> (CpuState, FlatTestBus) {
        let mut st = CpuState::new(CpuFeatures::all_features());
        st.load_segment_real(Seg::Ds, 0);
        (st, FlatTestBus::new(0x1000))
    }

    const K0: Kreg = Kreg(0);
    const K1: Kreg = Kreg(1);
    const K2: Kreg = Kreg(2);

    #[test]
    fn binary_ops_mask_and_zero_extend() {
        let (mut st, _) = setup();
        st.mask_write64(K1, 0xFFFF_0F0F);
        st.mask_write64(K2, 0x0000_00FF);
        st.mask_write64(K0, u64::MAX);

        kbin(&mut st, KBinOp::And, K0, K1, K2, Width::W16).unwrap();
        assert_eq!(st.mask_read64(K0), 0x000F, "result replaced all 64 bits");
        kbin(&mut st, KBinOp::Andn, K0, K1, K2, Width::W16).unwrap();
        assert_eq!(st.mask_read64(K0), 0x00F0);
        kbin(&mut st, KBinOp::Or, K0, K1, K2, Width::W16).unwrap();
        assert_eq!(st.mask_read64(K0), 0x0FFF);
        kbin(&mut st, KBinOp::Xor, K0, K1, K2, Width::W16).unwrap();
        assert_eq!(st.mask_read64(K0), 0x0FF0);
        kbin(&mut st, KBinOp::Xnor, K0, K1, K2, Width::W16).unwrap();
        assert_eq!(st.mask_read64(K0), 0xF00F);
    }

    #[test]
    fn add_wraps_at_operand_width() {
        let (mut st, _) = setup();
        st.mask_write64(K1, 0xFFFF);
        st.mask_write64(K2, 3);
        kbin(&mut st, KBinOp::Add, K0, K1, K2, Width::W16).unwrap();
        assert_eq!(st.mask_read64(K0), 2);
        kbin(&mut st, KBinOp::Add, K0, K1, K2, Width::W32).unwrap();
        assert_eq!(st.mask_read64(K0), 0x1_0002);
    }

    #[test]
    fn not_and_shifts() {
        let (mut st, _) = setup();
        st.mask_write64(K1, 0x00F0);
        knot(&mut st, K0, K1, Width::W8).unwrap();
        assert_eq!(st.mask_read64(K0), 0x0F);

        st.mask_write64(K1, 0x8001);
        kshift(&mut st, K0, K1, 1, Width::W16, true).unwrap();
        assert_eq!(st.mask_read64(K0), 0x0002, "top bit shifted out");
        kshift(&mut st, K0, K1, 1, Width::W16, false).unwrap();
        assert_eq!(st.mask_read64(K0), 0x4000);

        // Counts at or past the width clear the destination.
        kshift(&mut st, K0, K1, 16, Width::W16, true).unwrap();
        assert_eq!(st.mask_read64(K0), 0);
        kshift(&mut st, K0, K1, 64, Width::W64, false).unwrap();
        assert_eq!(st.mask_read64(K0), 0);
    }

    #[test]
    fn unpack_concatenates_halves() {
        let (mut st, _) = setup();
        st.mask_write64(K1, 0xAABB);
        st.mask_write64(K2, 0xCCDD);
        kunpck(&mut st, K0, K1, K2, Width::W8).unwrap();
        assert_eq!(st.mask_read64(K0), 0xBBDD);
        kunpck(&mut st, K0, K1, K2, Width::W16).unwrap();
        assert_eq!(st.mask_read64(K0), 0xAABB_CCDD);
    }

    #[test]
    fn kortest_reports_empty_and_full() {
        let (mut st, _) = setup();
        st.mask_write64(K1, 0);
        st.mask_write64(K2, 0);
        kortest(&mut st, K1, K2, Width::W8).unwrap();
        assert!(st.rflags.get_zf());
        assert!(!st.rflags.get_cf());

        st.mask_write64(K1, 0xF0);
        st.mask_write64(K2, 0x0F);
        kortest(&mut st, K1, K2, Width::W8).unwrap();
        assert!(!st.rflags.get_zf());
        assert!(st.rflags.get_cf());

        kortest(&mut st, K1, K1, Width::W8).unwrap();
        assert!(!st.rflags.get_zf());
        assert!(!st.rflags.get_cf());
    }

    #[test]
    fn ktest_disjoint_and_covered() {
        let (mut st, _) = setup();
        st.mask_write64(K1, 0b1100);
        st.mask_write64(K2, 0b0011);
        ktest(&mut st, K1, K2, Width::W8).unwrap();
        assert!(st.rflags.get_zf(), "no shared bits");
        assert!(!st.rflags.get_cf());

        st.mask_write64(K2, 0b0100);
        ktest(&mut st, K1, K2, Width::W8).unwrap();
        assert!(!st.rflags.get_zf());
        assert!(st.rflags.get_cf(), "src2 within src1");
    }

    #[test]
    fn moves_between_kregs_gprs_and_memory() {
        let (mut st, mut bus) = setup();
        st.write64(Gpr::Rax.index(), 0xDEAD_BEEF_1234_5678);
        kmov_from_gpr(&mut st, K1, Gpr::Rax, Width::W16).unwrap();
        assert_eq!(st.mask_read64(K1), 0x5678);

        st.write64(Gpr::Rbx.index(), u64::MAX);
        kmov_to_gpr(&mut st, Gpr::Rbx, K1, Width::W16).unwrap();
        assert_eq!(st.read64(Gpr::Rbx.index()), 0x5678, "32-bit write zeroed the rest");

        kmov_rr(&mut st, K2, K1, Width::W8).unwrap();
        assert_eq!(st.mask_read64(K2), 0x78);

        let at = Addr::abs(Seg::Ds, 0x40);
        kmov_store(&mut st, &mut bus, at, K1, Width::W16).unwrap();
        assert_eq!(bus.read_u16(0x40).unwrap(), 0x5678);
        kmov_load(&mut st, &mut bus, K0, at, Width::W64).unwrap();
        assert_eq!(st.mask_read64(K0), 0x5678, "load pulled eight bytes");
    }
}

//! Two-operand arithmetic and logic, plus the one-operand INC/DEC/NEG/NOT
//! group. Results commit before the flag shadow is replaced, so a faulting
//! destination write leaves the flags of the previous instruction intact.

use quartz_x86::{AluOp, Operand, Width};

use crate::exceptions::Fault;
use crate::flags::LazyFlags;
use crate::mem::CpuBus;
use crate::state::CpuState;

use super::{read_operand, write_operand};

pub fn alu(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    op: AluOp,
    dst: Operand,
    src: Operand,
    width: Width,
) -> Result<(), Fault> {
    let lhs = read_operand(state, bus, &dst, width)?;
    let rhs = read_operand(state, bus, &src, width)?;
    let carry_in = matches!(op, AluOp::Adc | AluOp::Sbb) && state.rflags.get_cf();
    let carry = u64::from(carry_in);
    let mask = width.mask();

    let (result, lazy) = match op {
        AluOp::Add => {
            let result = lhs.wrapping_add(rhs) & mask;
            (
                result,
                LazyFlags::Add {
                    lhs,
                    rhs,
                    width,
                    result,
                },
            )
        }
        AluOp::Adc => {
            let result = lhs.wrapping_add(rhs).wrapping_add(carry) & mask;
            (
                result,
                LazyFlags::Adc {
                    lhs,
                    rhs,
                    carry_in,
                    width,
                    result,
                },
            )
        }
        AluOp::Sub | AluOp::Cmp => {
            let result = lhs.wrapping_sub(rhs) & mask;
            (
                result,
                LazyFlags::Sub {
                    lhs,
                    rhs,
                    width,
                    result,
                },
            )
        }
        AluOp::Sbb => {
            let result = lhs.wrapping_sub(rhs).wrapping_sub(carry) & mask;
            (
                result,
                LazyFlags::Sbb {
                    lhs,
                    rhs,
                    carry_in,
                    width,
                    result,
                },
            )
        }
        AluOp::And | AluOp::Test => {
            let result = lhs & rhs & mask;
            (result, LazyFlags::Logic { result, width })
        }
        AluOp::Or => {
            let result = (lhs | rhs) & mask;
            (result, LazyFlags::Logic { result, width })
        }
        AluOp::Xor => {
            let result = (lhs ^ rhs) & mask;
            (result, LazyFlags::Logic { result, width })
        }
    };

    if !matches!(op, AluOp::Cmp | AluOp::Test) {
        write_operand(state, bus, &dst, width, result)?;
    }
    state.rflags.set_lazy(lazy);
    Ok(())
}

/// INC and DEC preserve CF; the shadow captures it at execution time.
pub fn inc_dec(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: Operand,
    width: Width,
    dec: bool,
) -> Result<(), Fault> {
    let lhs = read_operand(state, bus, &dst, width)?;
    let result = if dec {
        lhs.wrapping_sub(1)
    } else {
        lhs.wrapping_add(1)
    } & width.mask();
    let carry = state.rflags.get_cf();
    write_operand(state, bus, &dst, width, result)?;
    state.rflags.set_lazy(LazyFlags::IncDec {
        dec,
        lhs,
        width,
        result,
        carry,
    });
    Ok(())
}

pub fn neg(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: Operand,
    width: Width,
) -> Result<(), Fault> {
    let rhs = read_operand(state, bus, &dst, width)?;
    let result = 0u64.wrapping_sub(rhs) & width.mask();
    write_operand(state, bus, &dst, width, result)?;
    state.rflags.set_lazy(LazyFlags::Sub {
        lhs: 0,
        rhs,
        width,
        result,
    });
    Ok(())
}

/// NOT is the family's odd one out: no flags at all.
pub fn not(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: Operand,
    width: Width,
) -> Result<(), Fault> {
    let val = read_operand(state, bus, &dst, width)?;
    write_operand(state, bus, &dst, width, !val & width.mask())
}

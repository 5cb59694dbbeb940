//! Plain moves, widening moves, and exchange. None of these touch flags.

use quartz_x86::{Operand, Reg, Width};

use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::state::CpuState;

use super::{read_operand, sign_extend, write_operand};

pub fn mov(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: Operand,
    src: Operand,
    width: Width,
) -> Result<(), Fault> {
    let val = read_operand(state, bus, &src, width)?;
    write_operand(state, bus, &dst, width, val)
}

pub fn movzx(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: Reg,
    src: Operand,
    src_width: Width,
) -> Result<(), Fault> {
    let val = read_operand(state, bus, &src, src_width)?;
    state.write_reg(dst, val);
    Ok(())
}

pub fn movsx(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: Reg,
    src: Operand,
    src_width: Width,
) -> Result<(), Fault> {
    let val = read_operand(state, bus, &src, src_width)?;
    state.write_reg(dst, sign_extend(val, src_width) as u64);
    Ok(())
}

/// Both reads precede both writes; the memory side commits first so a fault
/// cannot leave the register half of the swap applied.
pub fn xchg(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    a: Operand,
    b: Operand,
    width: Width,
) -> Result<(), Fault> {
    let va = read_operand(state, bus, &a, width)?;
    let vb = read_operand(state, bus, &b, width)?;
    if matches!(b, Operand::Mem(_)) {
        write_operand(state, bus, &b, width, va)?;
        write_operand(state, bus, &a, width, vb)
    } else {
        write_operand(state, bus, &a, width, vb)?;
        write_operand(state, bus, &b, width, va)
    }
}

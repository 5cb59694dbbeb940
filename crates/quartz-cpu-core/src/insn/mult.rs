//! Multiply family. The widening forms spread the product over the
//! accumulator pair; CF and OF report whether the upper half carries
//! information the truncated result lost. SF/ZF/PF are derived from the low
//! half and AF is cleared, fixing bits the architecture leaves undefined.

use quartz_x86::{Gpr, Operand, Reg, Width};

use crate::exceptions::Fault;
use crate::flags::LazyFlags;
use crate::mem::CpuBus;
use crate::state::CpuState;

use super::{read_operand, sign_extend};

const RAX: usize = Gpr::Rax as usize;
const RDX: usize = Gpr::Rdx as usize;

/// DX:AX-style split write of a double-width product.
fn write_widening(state: &mut CpuState, width: Width, low: u64, high: u64) {
    match width {
        Width::W8 => state.write16(RAX, (high << 8 | low & 0xFF) as u16),
        Width::W16 => {
            state.write16(RAX, low as u16);
            state.write16(RDX, high as u16);
        }
        Width::W32 => {
            state.write32(RAX, low as u32);
            state.write32(RDX, high as u32);
        }
        Width::W64 => {
            state.write64(RAX, low);
            state.write64(RDX, high);
        }
    }
}

pub fn mul(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    src: Operand,
    width: Width,
) -> Result<(), Fault> {
    let rhs = read_operand(state, bus, &src, width)?;
    let lhs = state.read64(RAX) & width.mask();
    let full = u128::from(lhs) * u128::from(rhs);
    let low = full as u64 & width.mask();
    let high = (full >> width.bits()) as u64 & width.mask();
    write_widening(state, width, low, high);
    state.rflags.set_lazy(LazyFlags::Mul {
        low,
        upper_significant: high != 0,
        width,
    });
    Ok(())
}

fn signed_product(lhs: u64, rhs: u64, width: Width) -> (u64, u64, bool) {
    let full = i128::from(sign_extend(lhs, width)) * i128::from(sign_extend(rhs, width));
    let low = full as u64 & width.mask();
    let high = (full >> width.bits()) as u64 & width.mask();
    // Significant unless the upper half is pure sign extension of the low.
    let significant = full != i128::from(sign_extend(low, width));
    (low, high, significant)
}

pub fn imul1(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    src: Operand,
    width: Width,
) -> Result<(), Fault> {
    let rhs = read_operand(state, bus, &src, width)?;
    let lhs = state.read64(RAX) & width.mask();
    let (low, high, significant) = signed_product(lhs, rhs, width);
    write_widening(state, width, low, high);
    state.rflags.set_lazy(LazyFlags::Mul {
        low,
        upper_significant: significant,
        width,
    });
    Ok(())
}

pub fn imul2(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: Reg,
    src: Operand,
    width: Width,
) -> Result<(), Fault> {
    let rhs = read_operand(state, bus, &src, width)?;
    let lhs = state.read_reg(dst);
    let (low, _, significant) = signed_product(lhs, rhs, width);
    state.write_reg(dst, low);
    state.rflags.set_lazy(LazyFlags::Mul {
        low,
        upper_significant: significant,
        width,
    });
    Ok(())
}

pub fn imul3(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: Reg,
    src: Operand,
    imm: u64,
    width: Width,
) -> Result<(), Fault> {
    let lhs = read_operand(state, bus, &src, width)?;
    let (low, _, significant) = signed_product(lhs, imm, width);
    state.write_reg(dst, low);
    state.rflags.set_lazy(LazyFlags::Mul {
        low,
        upper_significant: significant,
        width,
    });
    Ok(())
}

//! Instruction handlers, one module per family.
//!
//! Every handler has the same contract with the dispatch engine: the
//! instruction pointer has already been advanced past the instruction, a
//! raised [`Fault`] means the instruction never happened (the engine rolls
//! back and starts delivery), and a handler that raises must do nothing else
//! afterwards. Handlers therefore order their work so all faultable steps
//! precede the first architectural write where the encoding allows it.

pub mod alu;
pub mod ctrl_xfer;
pub mod data_xfer;
pub mod flag_ctrl;
pub mod mult;
pub mod opmask;
pub mod system;

use quartz_x86::{InsnKind, Operand, Width};

use crate::exceptions::Fault;
use crate::mem::{self, CpuBus};
use crate::state::CpuState;

/// Executes one decoded operation against the state and bus.
pub fn execute(state: &mut CpuState, bus: &mut dyn CpuBus, kind: &InsnKind) -> Result<(), Fault> {
    // The fetch mask keeps these out of the decode stream when the extension
    // is off; a decoder that skips that filter still may not reach them.
    if kind.is_opmask() && !state.opmask_enabled() {
        return Err(Fault::ud());
    }
    match *kind {
        InsnKind::Alu {
            op,
            dst,
            src,
            width,
        } => alu::alu(state, bus, op, dst, src, width),
        InsnKind::Inc { dst, width } => alu::inc_dec(state, bus, dst, width, false),
        InsnKind::Dec { dst, width } => alu::inc_dec(state, bus, dst, width, true),
        InsnKind::Neg { dst, width } => alu::neg(state, bus, dst, width),
        InsnKind::Not { dst, width } => alu::not(state, bus, dst, width),
        InsnKind::Mov { dst, src, width } => data_xfer::mov(state, bus, dst, src, width),
        InsnKind::Movzx {
            dst,
            src,
            src_width,
        } => data_xfer::movzx(state, bus, dst, src, src_width),
        InsnKind::Movsx {
            dst,
            src,
            src_width,
        } => data_xfer::movsx(state, bus, dst, src, src_width),
        InsnKind::Xchg { a, b, width } => data_xfer::xchg(state, bus, a, b, width),
        InsnKind::Mul { src, width } => mult::mul(state, bus, src, width),
        InsnKind::Imul1 { src, width } => mult::imul1(state, bus, src, width),
        InsnKind::Imul2 { dst, src, width } => mult::imul2(state, bus, dst, src, width),
        InsnKind::Imul3 {
            dst,
            src,
            imm,
            width,
        } => mult::imul3(state, bus, dst, src, imm, width),
        InsnKind::Clc => flag_ctrl::clc(state),
        InsnKind::Stc => flag_ctrl::stc(state),
        InsnKind::Cmc => flag_ctrl::cmc(state),
        InsnKind::Cld => flag_ctrl::cld(state),
        InsnKind::Std => flag_ctrl::std(state),
        InsnKind::Cli => flag_ctrl::cli(state),
        InsnKind::Sti => flag_ctrl::sti(state),
        InsnKind::Lahf => flag_ctrl::lahf(state),
        InsnKind::Sahf => flag_ctrl::sahf(state),
        InsnKind::Pushf { width } => flag_ctrl::pushf(state, bus, width),
        InsnKind::Popf { width } => flag_ctrl::popf(state, bus, width),
        InsnKind::JmpRel { target } => ctrl_xfer::jmp(state, target),
        InsnKind::Jcc { cond, target } => ctrl_xfer::jcc(state, cond, target),
        InsnKind::CallRel { target } => ctrl_xfer::call(state, bus, target),
        InsnKind::RetNear { pop } => ctrl_xfer::ret_near(state, bus, pop),
        InsnKind::Nop => Ok(()),
        InsnKind::Hlt => system::hlt(state),
        InsnKind::Int { vector } => ctrl_xfer::int_n(state, bus, vector),
        InsnKind::Int3 => ctrl_xfer::int3(state, bus),
        InsnKind::Into => ctrl_xfer::into(state, bus),
        InsnKind::Int1 => ctrl_xfer::int1(state, bus),
        InsnKind::Iret { width } => ctrl_xfer::iret(state, bus, width),
        InsnKind::Ud2 => Err(Fault::ud()),
        InsnKind::KBin {
            op,
            dst,
            src1,
            src2,
            width,
        } => opmask::kbin(state, op, dst, src1, src2, width),
        InsnKind::Knot { dst, src, width } => opmask::knot(state, dst, src, width),
        InsnKind::Kshiftl {
            dst,
            src,
            count,
            width,
        } => opmask::kshift(state, dst, src, count, width, true),
        InsnKind::Kshiftr {
            dst,
            src,
            count,
            width,
        } => opmask::kshift(state, dst, src, count, width, false),
        InsnKind::Kunpck {
            dst,
            src1,
            src2,
            half,
        } => opmask::kunpck(state, dst, src1, src2, half),
        InsnKind::Kortest { src1, src2, width } => opmask::kortest(state, src1, src2, width),
        InsnKind::Ktest { src1, src2, width } => opmask::ktest(state, src1, src2, width),
        InsnKind::KmovRR { dst, src, width } => opmask::kmov_rr(state, dst, src, width),
        InsnKind::KmovLoad { dst, addr, width } => opmask::kmov_load(state, bus, dst, addr, width),
        InsnKind::KmovStore { addr, src, width } => {
            opmask::kmov_store(state, bus, addr, src, width)
        }
        InsnKind::KmovFromGpr { dst, src, width } => opmask::kmov_from_gpr(state, dst, src, width),
        InsnKind::KmovToGpr { dst, src, width } => opmask::kmov_to_gpr(state, dst, src, width),
    }
}

/// Reads one operand, zero-extended to 64 bits.
pub(crate) fn read_operand(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    op: &Operand,
    width: Width,
) -> Result<u64, Fault> {
    match *op {
        Operand::Reg(reg) => Ok(state.read_reg(reg)),
        Operand::Imm(v) => Ok(v & width.mask()),
        Operand::Mem(ref addr) => {
            let ea = mem::resolve_addr(state, addr);
            mem::read_mem(state, bus, addr.seg, ea, width)
        }
    }
}

/// Writes one operand. An immediate destination is a decoder defect and
/// surfaces as #UD rather than corrupting state.
pub(crate) fn write_operand(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    op: &Operand,
    width: Width,
    val: u64,
) -> Result<(), Fault> {
    match *op {
        Operand::Reg(reg) => {
            state.write_reg(reg, val);
            Ok(())
        }
        Operand::Imm(_) => Err(Fault::ud()),
        Operand::Mem(ref addr) => {
            let ea = mem::resolve_addr(state, addr);
            mem::write_mem(state, bus, addr.seg, ea, width, val)
        }
    }
}

/// Sign-extends a `width`-sized value to 64 bits.
pub(crate) fn sign_extend(v: u64, width: Width) -> i64 {
    let shift = 64 - width.bits();
    ((v << shift) as i64) >> shift
}

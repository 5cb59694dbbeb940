//! Direct flag manipulation: the carry/direction setters, the IF gate pair,
//! LAHF/SAHF, and the flags-image stack forms.

use quartz_x86::Width;

use crate::exceptions::Fault;
use crate::flags::{RFLAGS_DEFINED, RFLAGS_IF, RFLAGS_IOPL, RFLAGS_RF, RFLAGS_VM};
use crate::mem::{self, CpuBus};
use crate::mode::CpuMode;
use crate::state::CpuState;

pub fn clc(state: &mut CpuState) -> Result<(), Fault> {
    state.rflags.clear_cf();
    Ok(())
}

pub fn stc(state: &mut CpuState) -> Result<(), Fault> {
    state.rflags.assert_cf();
    Ok(())
}

pub fn cmc(state: &mut CpuState) -> Result<(), Fault> {
    let cf = state.rflags.get_cf();
    state.rflags.set_cf(!cf);
    Ok(())
}

pub fn cld(state: &mut CpuState) -> Result<(), Fault> {
    state.rflags.set_df(false);
    Ok(())
}

pub fn std(state: &mut CpuState) -> Result<(), Fault> {
    state.rflags.set_df(true);
    Ok(())
}

/// IF may only be cleared when CPL does not exceed IOPL; this covers real
/// mode (CPL 0), virtual-8086 (CPL 3, needs IOPL 3), and protected rings
/// with one rule.
pub fn cli(state: &mut CpuState) -> Result<(), Fault> {
    if state.cpl() > state.rflags.iopl() {
        return Err(Fault::gp0());
    }
    state.clear_if();
    Ok(())
}

/// Setting IF opens a one-instruction delivery shadow: events gated on IF
/// stay held until the instruction after STI retires.
pub fn sti(state: &mut CpuState) -> Result<(), Fault> {
    if state.cpl() > state.rflags.iopl() {
        return Err(Fault::gp0());
    }
    if !state.rflags.get_if() {
        state.events.inhibit_interrupts();
        state.assert_if();
    }
    Ok(())
}

pub fn lahf(state: &mut CpuState) -> Result<(), Fault> {
    let image = state.rflags.read() as u8;
    state.write8(4, false, image);
    Ok(())
}

pub fn sahf(state: &mut CpuState) -> Result<(), Fault> {
    let ah = state.read8(4, false);
    state.rflags.write_masked(u64::from(ah), 0xD5);
    Ok(())
}

pub fn pushf(state: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Fault> {
    if state.mode() == CpuMode::Virtual8086 && state.rflags.iopl() < 3 {
        return Err(Fault::gp0());
    }
    // The pushed image never exposes VM or RF.
    let image = state.rflags.read() & !(RFLAGS_VM | RFLAGS_RF);
    mem::push(state, bus, width, image & width.mask())
}

pub fn popf(state: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Fault> {
    if state.mode() == CpuMode::Virtual8086 && state.rflags.iopl() < 3 {
        return Err(Fault::gp0());
    }
    let value = mem::pop(state, bus, width)?;
    let mut mask = RFLAGS_DEFINED & !(RFLAGS_VM | RFLAGS_RF);
    if state.cpl() > 0 {
        mask &= !RFLAGS_IOPL;
    }
    if state.cpl() > state.rflags.iopl() {
        mask &= !RFLAGS_IF;
    }
    if width == Width::W16 {
        mask &= 0xFFFF;
    }
    state.write_flags(value, mask);
    Ok(())
}

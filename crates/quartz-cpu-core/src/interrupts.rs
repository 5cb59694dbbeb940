//! Event vectoring: IVT and IDT walks, privilege transitions, error-code
//! pushes, double-fault escalation, and IRET.
//!
//! Two entry layers. Instruction handlers (INT n, INT3, IRET) call the
//! single-attempt functions and propagate any nested [`Fault`] to the
//! dispatch loop like every other instruction. The boundary layer
//! ([`deliver_fault`], [`deliver_external`]) owns the escalation chain:
//! a fault raised while vectoring either replaces the event, escalates to
//! `#DF` per the class matrix, or ends in shutdown.

use quartz_x86::{Seg, Width};

use crate::events::EventSet;
use crate::exceptions::{idt_error_code, should_double_fault, Exception, Fault, FaultClass};
use crate::flags::{RFLAGS_DEFINED, RFLAGS_IF, RFLAGS_IOPL, RFLAGS_RF, RFLAGS_VM};
use crate::mem::{self, CpuBus};
use crate::mode::CpuMode;
use crate::state::{ActivityState, CpuState, SegmentRegister};

/// What kind of event is being vectored. Decides gate-DPL enforcement and
/// the EXT bit on nested error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// INTR or LAPIC vector, acknowledged from the controller.
    External,
    Nmi,
    /// INT imm8.
    SoftwareInt,
    /// INT3 and INTO.
    SoftwareException,
    /// INT1; skips the gate DPL check like a hardware event.
    PrivilegedSoftware,
    /// Faults and traps raised by execution.
    HardwareException,
}

impl InterruptSource {
    /// Gate DPL is only enforced against CPL for the programmable INT forms.
    fn checks_gate_dpl(self) -> bool {
        matches!(self, Self::SoftwareInt | Self::SoftwareException)
    }
}

fn sel_code(selector: u16, ext: bool) -> u16 {
    (selector & 0xFFFC) | u16::from(ext)
}

/// A parsed IDT entry, either legacy 8-byte or long-mode 16-byte form.
struct IdtGate {
    selector: u16,
    offset: u64,
    ist: u8,
    /// 32-bit (or 64-bit) gate; 16-bit gates truncate EIP and push words.
    gate32: bool,
    /// Trap gates leave IF alone.
    trap: bool,
    dpl: u8,
    present: bool,
}

fn read_idt_gate_legacy(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    ext: bool,
) -> Result<IdtGate, Fault> {
    let index = u64::from(vector) * 8;
    if index + 7 > u64::from(state.idtr.limit) {
        return Err(Fault::gp(idt_error_code(vector) | u16::from(ext)));
    }
    let lo = bus.read_u32(state.idtr.base + index)?;
    let hi = bus.read_u32(state.idtr.base + index + 4)?;
    let access = (hi >> 8) & 0xFF;
    let gate_type = access & 0x1F;
    let (gate32, trap) = match gate_type {
        0x06 => (false, false),
        0x07 => (false, true),
        0x0E => (true, false),
        0x0F => (true, true),
        // Task gates and everything else are rejected; hardware task
        // switching is not modeled.
        _ => return Err(Fault::gp(idt_error_code(vector) | u16::from(ext))),
    };
    let mut offset = u64::from(lo & 0xFFFF) | u64::from(hi & 0xFFFF_0000);
    if !gate32 {
        offset &= 0xFFFF;
    }
    Ok(IdtGate {
        selector: (lo >> 16) as u16,
        offset,
        ist: 0,
        gate32,
        trap,
        dpl: ((access >> 5) & 3) as u8,
        present: access & 0x80 != 0,
    })
}

fn read_idt_gate_long(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    ext: bool,
) -> Result<IdtGate, Fault> {
    let index = u64::from(vector) * 16;
    if index + 15 > u64::from(state.idtr.limit) {
        return Err(Fault::gp(idt_error_code(vector) | u16::from(ext)));
    }
    let lo = bus.read_u32(state.idtr.base + index)?;
    let hi = bus.read_u32(state.idtr.base + index + 4)?;
    let top = bus.read_u32(state.idtr.base + index + 8)?;
    let access = (hi >> 8) & 0xFF;
    let trap = match access & 0x1F {
        0x0E => false,
        0x0F => true,
        _ => return Err(Fault::gp(idt_error_code(vector) | u16::from(ext))),
    };
    Ok(IdtGate {
        selector: (lo >> 16) as u16,
        offset: u64::from(lo & 0xFFFF) | u64::from(hi & 0xFFFF_0000) | u64::from(top) << 32,
        ist: (hi & 7) as u8,
        gate32: true,
        trap,
        dpl: ((access >> 5) & 3) as u8,
        present: access & 0x80 != 0,
    })
}

/// Reads the two descriptor words for `selector` from the GDT. The local
/// table is not modeled; a selector with TI set is rejected.
fn read_gdt_descriptor(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    selector: u16,
    ext: bool,
) -> Result<(u32, u32), Fault> {
    if selector & 4 != 0 {
        return Err(Fault::gp(sel_code(selector, ext)));
    }
    let index = u64::from(selector & 0xFFF8);
    if index + 7 > u64::from(state.gdtr.limit) {
        return Err(Fault::gp(sel_code(selector, ext)));
    }
    let lo = bus.read_u32(state.gdtr.base + index)?;
    let hi = bus.read_u32(state.gdtr.base + index + 4)?;
    Ok((lo, hi))
}

fn seg_cache_from_descriptor(selector: u16, lo: u32, hi: u32) -> SegmentRegister {
    let mut limit = lo & 0xFFFF | hi & 0x000F_0000;
    if hi & 1 << 23 != 0 {
        limit = limit << 12 | 0xFFF;
    }
    SegmentRegister {
        selector,
        base: u64::from(lo >> 16) | u64::from(hi & 0xFF) << 16 | u64::from(hi >> 24) << 24,
        limit,
        access: (hi >> 8) as u8,
        long: hi & 1 << 21 != 0,
        db: hi & 1 << 22 != 0,
    }
}

fn is_writable_data(access: u8) -> bool {
    access & 0x18 == 0x10 && access & 0x02 != 0
}

/// Ring-`dpl` stack slot from the 32-bit TSS.
fn tss_stack32(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    dpl: u8,
    ext: bool,
) -> Result<(u16, u32), Fault> {
    let offset = 4 + u64::from(dpl) * 8;
    if offset + 5 > u64::from(state.tr.limit) + 1 {
        return Err(Fault::with_code(
            Exception::InvalidTss,
            sel_code(state.tr.selector, ext),
        ));
    }
    let sp = bus.read_u32(state.tr.base + offset)?;
    let ss = bus.read_u16(state.tr.base + offset + 4)?;
    Ok((ss, sp))
}

/// RSPn or ISTn slot from the 64-bit TSS.
fn tss_stack64(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    slot: u64,
    ext: bool,
) -> Result<u64, Fault> {
    if slot + 7 > u64::from(state.tr.limit) {
        return Err(Fault::with_code(
            Exception::InvalidTss,
            sel_code(state.tr.selector, ext),
        ));
    }
    bus.read_u64(state.tr.base + slot)
}

// --- single delivery attempts, by mode ----------------------------------

fn real_mode_vector(state: &mut CpuState, bus: &mut dyn CpuBus, vector: u8) -> Result<(), Fault> {
    let index = u64::from(vector) * 4;
    if index + 3 > u64::from(state.idtr.limit) {
        return Err(Fault::gp0());
    }
    let offset = bus.read_u16(state.idtr.base + index)?;
    let segment = bus.read_u16(state.idtr.base + index + 2)?;

    let image = state.rflags.read();
    let old_cs = u64::from(state.cs().selector);
    let old_ip = state.rip() & 0xFFFF;
    mem::push(state, bus, Width::W16, image & 0xFFFF)?;
    mem::push(state, bus, Width::W16, old_cs)?;
    mem::push(state, bus, Width::W16, old_ip)?;

    state.clear_if();
    state.clear_tf();
    state.clear_rf();
    state.set_ac(false);

    state.load_segment_real(Seg::Cs, segment);
    state.set_rip(u64::from(offset));
    Ok(())
}

fn protected_vector(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    source: InterruptSource,
    error_code: Option<u16>,
    ext: bool,
) -> Result<(), Fault> {
    let gate = read_idt_gate_legacy(state, bus, vector, ext)?;
    if source.checks_gate_dpl() && gate.dpl < state.cpl() {
        return Err(Fault::gp(idt_error_code(vector)));
    }
    if !gate.present {
        return Err(Fault::np(idt_error_code(vector) | u16::from(ext)));
    }
    if gate.selector & 0xFFFC == 0 {
        return Err(Fault::gp(u16::from(ext)));
    }

    let (lo, hi) = read_gdt_descriptor(state, bus, gate.selector, ext)?;
    let target = seg_cache_from_descriptor(gate.selector, lo, hi);
    if !target.is_code() || target.dpl() > state.cpl() {
        return Err(Fault::gp(sel_code(gate.selector, ext)));
    }
    if !target.present() {
        return Err(Fault::np(sel_code(gate.selector, ext)));
    }

    let push_width = if gate.gate32 { Width::W32 } else { Width::W16 };
    let image = state.rflags.read();
    let from_vm86 = state.rflags.get_vm();
    let old_cs = u64::from(state.cs().selector);
    let old_ip = state.rip();

    let new_cpl = if !target.is_conforming() && target.dpl() < state.cpl() {
        // Inner-ring transition: stack comes from the TSS.
        if from_vm86 && target.dpl() != 0 {
            return Err(Fault::gp(sel_code(gate.selector, ext)));
        }
        let (ss_sel, new_sp) = tss_stack32(state, bus, target.dpl(), ext)?;
        if ss_sel & 0xFFFC == 0 {
            return Err(Fault::with_code(Exception::InvalidTss, u16::from(ext)));
        }
        if ss_sel & 3 != u16::from(target.dpl()) {
            return Err(Fault::with_code(Exception::InvalidTss, sel_code(ss_sel, ext)));
        }
        let (ss_lo, ss_hi) = read_gdt_descriptor(state, bus, ss_sel, ext)?;
        let new_ss = seg_cache_from_descriptor(ss_sel, ss_lo, ss_hi);
        if new_ss.dpl() != target.dpl() || !is_writable_data(new_ss.access) {
            return Err(Fault::with_code(Exception::InvalidTss, sel_code(ss_sel, ext)));
        }
        if !new_ss.present() {
            return Err(Fault::with_code(Exception::StackFault, sel_code(ss_sel, ext)));
        }

        let old_ss = u64::from(state.ss().selector);
        let old_sp = state.read64(4);
        *state.segment_mut(Seg::Ss) = new_ss;
        state.write64(4, u64::from(new_sp));

        if from_vm86 {
            for seg in [Seg::Gs, Seg::Fs, Seg::Ds, Seg::Es] {
                let sel = u64::from(state.segment(seg).selector);
                mem::push(state, bus, push_width, sel)?;
            }
        }
        mem::push(state, bus, push_width, old_ss)?;
        mem::push(state, bus, push_width, old_sp)?;
        target.dpl()
    } else {
        if from_vm86 {
            // A virtual-8086 interrupt must land in a ring-0 handler.
            return Err(Fault::gp(sel_code(gate.selector, ext)));
        }
        state.cpl()
    };

    mem::push(state, bus, push_width, image)?;
    mem::push(state, bus, push_width, old_cs)?;
    mem::push(state, bus, push_width, old_ip)?;
    if let Some(code) = error_code {
        mem::push(state, bus, push_width, u64::from(code))?;
    }

    if from_vm86 {
        for seg in [Seg::Ds, Seg::Es, Seg::Fs, Seg::Gs] {
            *state.segment_mut(seg) = SegmentRegister::null();
        }
    }

    let mut new_cs = target;
    new_cs.selector = (gate.selector & 0xFFFC) | u16::from(new_cpl);
    *state.segment_mut(Seg::Cs) = new_cs;

    state.rflags.set_nt(false);
    state.clear_tf();
    state.clear_rf();
    if !gate.trap {
        state.clear_if();
    }
    if from_vm86 {
        state.rflags.set_vm_raw(false);
    }
    state.update_mode();
    state.set_rip(gate.offset);
    Ok(())
}

fn long_vector(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    source: InterruptSource,
    error_code: Option<u16>,
    ext: bool,
) -> Result<(), Fault> {
    let gate = read_idt_gate_long(state, bus, vector, ext)?;
    if source.checks_gate_dpl() && gate.dpl < state.cpl() {
        return Err(Fault::gp(idt_error_code(vector)));
    }
    if !gate.present {
        return Err(Fault::np(idt_error_code(vector) | u16::from(ext)));
    }
    if gate.selector & 0xFFFC == 0 {
        return Err(Fault::gp(u16::from(ext)));
    }
    if !mem::canonical(gate.offset) {
        return Err(Fault::gp0());
    }

    let (lo, hi) = read_gdt_descriptor(state, bus, gate.selector, ext)?;
    let target = seg_cache_from_descriptor(gate.selector, lo, hi);
    if !target.is_code() || target.dpl() > state.cpl() {
        return Err(Fault::gp(sel_code(gate.selector, ext)));
    }
    // Long-mode handlers run in 64-bit code.
    if !target.long || target.db {
        return Err(Fault::gp(sel_code(gate.selector, ext)));
    }
    if !target.present() {
        return Err(Fault::np(sel_code(gate.selector, ext)));
    }

    let image = state.rflags.read();
    let old_cs = u64::from(state.cs().selector);
    let old_ip = state.rip();
    let old_ss = u64::from(state.ss().selector);
    let old_sp = state.read64(4);

    let ring_change = !target.is_conforming() && target.dpl() < state.cpl();
    let new_cpl = if ring_change { target.dpl() } else { state.cpl() };

    let mut new_sp = if gate.ist != 0 {
        tss_stack64(state, bus, 28 + u64::from(gate.ist) * 8, ext)?
    } else if ring_change {
        tss_stack64(state, bus, 4 + u64::from(new_cpl) * 8, ext)?
    } else {
        old_sp
    };
    new_sp &= !0xF;

    if ring_change {
        // SS is loaded with the null selector carrying the new RPL.
        let mut null_ss = SegmentRegister::null();
        null_ss.selector = u16::from(new_cpl);
        *state.segment_mut(Seg::Ss) = null_ss;
    }
    state.write64(4, new_sp);

    // The 64-bit frame always carries SS:RSP.
    mem::push(state, bus, Width::W64, old_ss)?;
    mem::push(state, bus, Width::W64, old_sp)?;
    mem::push(state, bus, Width::W64, image)?;
    mem::push(state, bus, Width::W64, old_cs)?;
    mem::push(state, bus, Width::W64, old_ip)?;
    if let Some(code) = error_code {
        mem::push(state, bus, Width::W64, u64::from(code))?;
    }

    let mut new_cs = target;
    new_cs.selector = (gate.selector & 0xFFFC) | u16::from(new_cpl);
    *state.segment_mut(Seg::Cs) = new_cs;

    state.rflags.set_nt(false);
    state.clear_tf();
    state.clear_rf();
    if !gate.trap {
        state.clear_if();
    }
    state.update_mode();
    state.set_rip(gate.offset);
    Ok(())
}

/// One vectoring attempt in the current mode. Callers own escalation.
fn vector_event(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    source: InterruptSource,
    error_code: Option<u16>,
    ext: bool,
) -> Result<(), Fault> {
    match state.mode() {
        CpuMode::Real => real_mode_vector(state, bus, vector),
        CpuMode::Long64 | CpuMode::LongCompat => {
            long_vector(state, bus, vector, source, error_code, ext)
        }
        _ => protected_vector(state, bus, vector, source, error_code, ext),
    }
}

/// INT n / INT3 / INTO / INT1. A nested fault is the instruction's own
/// raise; the dispatch loop rolls back and starts a fresh delivery chain.
pub fn software_interrupt(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    source: InterruptSource,
) -> Result<(), Fault> {
    if state.mode() == CpuMode::Virtual8086
        && source == InterruptSource::SoftwareInt
        && state.rflags.iopl() < 3
    {
        return Err(Fault::gp0());
    }
    vector_event(state, bus, vector, source, None, false)
}

// --- boundary delivery with escalation ----------------------------------

/// Delivers an exception raised by execution, escalating per the
/// double-fault matrix. Never returns a fault: the chain ends delivered or
/// in shutdown.
pub fn deliver_fault(state: &mut CpuState, bus: &mut dyn CpuBus, fault: Fault) {
    escalate(
        state,
        bus,
        fault.exception.vector(),
        InterruptSource::HardwareException,
        fault.error_code,
        fault.addr,
        Some(fault.exception.class()),
        false,
    );
}

/// Delivers an external vector (INTR, LAPIC, NMI). A fault while vectoring
/// starts a fresh exception chain with the EXT bit set; the interrupt
/// itself is dropped, matching a controller that will re-assert.
pub fn deliver_external(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    source: InterruptSource,
) {
    escalate(state, bus, vector, source, None, None, None, true);
}

#[allow(clippy::too_many_arguments)]
fn escalate(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    mut vector: u8,
    mut source: InterruptSource,
    mut error_code: Option<u16>,
    mut page_addr: Option<u64>,
    mut prev_class: Option<FaultClass>,
    mut ext: bool,
) {
    let mut delivering_df = false;
    loop {
        if let Some(addr) = page_addr {
            state.control.cr2 = addr;
        }
        let code = error_code.map(|c| {
            // Page-fault error codes have their own format and the
            // double-fault code is always zero; neither carries EXT.
            if vector == Exception::PageFault.vector()
                || vector == Exception::DoubleFault.vector()
            {
                c
            } else {
                c | u16::from(ext)
            }
        });
        match vector_event(state, bus, vector, source, code, ext) {
            Ok(()) => return,
            Err(nested) => {
                if delivering_df {
                    tracing::error!(
                        nested = ?nested.exception,
                        "fault while delivering a double fault, entering shutdown"
                    );
                    state.activity = ActivityState::Shutdown;
                    state.events.reset_pending();
                    return;
                }
                let nested_class = nested.exception.class();
                if prev_class.is_some_and(|first| should_double_fault(first, nested_class)) {
                    tracing::warn!(
                        first = vector,
                        second = nested.exception.vector(),
                        "escalating to double fault"
                    );
                    vector = Exception::DoubleFault.vector();
                    source = InterruptSource::HardwareException;
                    error_code = Some(0);
                    page_addr = None;
                    delivering_df = true;
                } else {
                    vector = nested.exception.vector();
                    source = InterruptSource::HardwareException;
                    error_code = nested.error_code;
                    page_addr = nested.addr;
                    prev_class = Some(nested_class);
                }
                ext = true;
            }
        }
    }
}

// --- IRET ----------------------------------------------------------------

fn iret_flag_mask(cpl: u8, iopl: u8, width: Width) -> u64 {
    let mut mask = RFLAGS_DEFINED & !RFLAGS_VM;
    if cpl > 0 {
        mask &= !RFLAGS_IOPL;
    }
    if cpl > iopl {
        mask &= !RFLAGS_IF;
    }
    if width == Width::W16 {
        mask &= 0xFFFF;
    }
    mask
}

fn stack_peek(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    slot: u64,
    width: Width,
) -> Result<u64, Fault> {
    let mask = match mem::stack_width(state) {
        Width::W64 => u64::MAX,
        Width::W32 => 0xFFFF_FFFF,
        _ => 0xFFFF,
    };
    let sp = state.read64(4).wrapping_add(slot * u64::from(width.bytes())) & mask;
    mem::read_mem(state, bus, Seg::Ss, sp, width)
}

fn stack_drop(state: &mut CpuState, slots: u64, width: Width) {
    let mask = match mem::stack_width(state) {
        Width::W64 => u64::MAX,
        Width::W32 => 0xFFFF_FFFF,
        _ => 0xFFFF,
    };
    let sp = state.read64(4);
    let new_sp = sp.wrapping_add(slots * u64::from(width.bytes())) & mask | (sp & !mask);
    state.write64(4, new_sp);
}

/// Interrupt return. Re-opens the NMI window first thing, then unwinds the
/// frame the current mode implies.
pub fn iret(state: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Fault> {
    state.events.unmask(EventSet::NMI);
    match state.mode() {
        CpuMode::Real => iret_real(state, bus, width),
        CpuMode::Virtual8086 => iret_v86(state, bus, width),
        CpuMode::Long64 => iret_long(state, bus, width),
        CpuMode::Protected | CpuMode::LongCompat => iret_protected(state, bus, width),
    }
}

fn iret_real(state: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Fault> {
    let ip = stack_peek(state, bus, 0, width)?;
    let cs = stack_peek(state, bus, 1, width)? as u16;
    let image = stack_peek(state, bus, 2, width)?;
    stack_drop(state, 3, width);

    // CPL 0: IOPL is writable; VM and RF are not reachable from IRET here.
    let mask = RFLAGS_DEFINED & !(RFLAGS_VM | RFLAGS_RF);
    let mask = if width == Width::W16 { mask & 0xFFFF } else { mask };
    state.write_flags(image, mask);
    state.load_segment_real(Seg::Cs, cs);
    state.set_rip(ip & width.mask());
    Ok(())
}

fn iret_v86(state: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Fault> {
    if state.rflags.iopl() != 3 {
        return Err(Fault::gp0());
    }
    let ip = stack_peek(state, bus, 0, width)?;
    let cs = stack_peek(state, bus, 1, width)? as u16;
    let image = stack_peek(state, bus, 2, width)?;
    stack_drop(state, 3, width);

    let mask = RFLAGS_DEFINED & !(RFLAGS_VM | RFLAGS_RF | RFLAGS_IOPL);
    let mask = if width == Width::W16 { mask & 0xFFFF } else { mask };
    state.write_flags(image, mask);
    state.load_segment_real(Seg::Cs, cs);
    state.set_rip(ip & width.mask());
    Ok(())
}

fn iret_protected(state: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Fault> {
    if state.rflags.get_nt() {
        // Task returns are not modeled.
        return Err(Fault::gp0());
    }

    let ip = stack_peek(state, bus, 0, width)?;
    let cs_sel = stack_peek(state, bus, 1, width)? as u16;
    let image = stack_peek(state, bus, 2, width)?;

    // IRETD at CPL 0 with VM set in the image resumes a virtual-8086 task.
    if width == Width::W32 && image & RFLAGS_VM != 0 && state.cpl() == 0 {
        return iret_to_v86(state, bus, ip, cs_sel, image);
    }

    if cs_sel & 0xFFFC == 0 {
        return Err(Fault::gp0());
    }
    let rpl = (cs_sel & 3) as u8;
    if rpl < state.cpl() {
        return Err(Fault::gp(sel_code(cs_sel, false)));
    }
    let (lo, hi) = read_gdt_descriptor(state, bus, cs_sel, false)?;
    let target = seg_cache_from_descriptor(cs_sel, lo, hi);
    if !target.is_code() {
        return Err(Fault::gp(sel_code(cs_sel, false)));
    }
    if target.is_conforming() {
        if target.dpl() > rpl {
            return Err(Fault::gp(sel_code(cs_sel, false)));
        }
    } else if target.dpl() != rpl {
        return Err(Fault::gp(sel_code(cs_sel, false)));
    }
    if !target.present() {
        return Err(Fault::np(sel_code(cs_sel, false)));
    }
    if ip & width.mask() > u64::from(target.limit) {
        return Err(Fault::gp0());
    }

    let mask = iret_flag_mask(state.cpl(), state.rflags.iopl(), width);

    if rpl == state.cpl() {
        stack_drop(state, 3, width);
        *state.segment_mut(Seg::Cs) = target;
        state.write_flags(image, mask);
        state.update_mode();
        state.set_rip(ip & width.mask());
        return Ok(());
    }

    // Return to an outer ring: the frame continues with SS:SP.
    let sp = stack_peek(state, bus, 3, width)?;
    let ss_sel = stack_peek(state, bus, 4, width)? as u16;
    if ss_sel & 0xFFFC == 0 {
        return Err(Fault::gp0());
    }
    if ss_sel & 3 != u16::from(rpl) {
        return Err(Fault::gp(sel_code(ss_sel, false)));
    }
    let (ss_lo, ss_hi) = read_gdt_descriptor(state, bus, ss_sel, false)?;
    let new_ss = seg_cache_from_descriptor(ss_sel, ss_lo, ss_hi);
    if !is_writable_data(new_ss.access) || new_ss.dpl() != rpl {
        return Err(Fault::gp(sel_code(ss_sel, false)));
    }
    if !new_ss.present() {
        return Err(Fault::with_code(
            Exception::StackFault,
            sel_code(ss_sel, false),
        ));
    }

    *state.segment_mut(Seg::Cs) = target;
    *state.segment_mut(Seg::Ss) = new_ss;
    set_popped_sp(state, sp, width);
    state.write_flags(image, mask);
    state.update_mode();
    state.set_rip(ip & width.mask());
    drop_invalid_segments(state);
    Ok(())
}

/// A 16-bit frame only replaces SP; wider frames replace the register.
fn set_popped_sp(state: &mut CpuState, sp: u64, width: Width) {
    if width == Width::W16 {
        let old = state.read64(4);
        state.write64(4, old & !0xFFFF | sp & 0xFFFF);
    } else {
        state.write64(4, sp & width.mask());
    }
}

fn iret_to_v86(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    ip: u64,
    cs: u16,
    image: u64,
) -> Result<(), Fault> {
    let width = Width::W32;
    let sp = stack_peek(state, bus, 3, width)?;
    let ss = stack_peek(state, bus, 4, width)? as u16;
    let es = stack_peek(state, bus, 5, width)? as u16;
    let ds = stack_peek(state, bus, 6, width)? as u16;
    let fs = stack_peek(state, bus, 7, width)? as u16;
    let gs = stack_peek(state, bus, 8, width)? as u16;

    state.write_flags(image, RFLAGS_DEFINED);
    for (seg, sel) in [
        (Seg::Cs, cs),
        (Seg::Ss, ss),
        (Seg::Es, es),
        (Seg::Ds, ds),
        (Seg::Fs, fs),
        (Seg::Gs, gs),
    ] {
        state.load_segment_real(seg, sel);
    }
    state.write64(4, sp & 0xFFFF_FFFF);
    state.update_mode();
    state.set_rip(ip & 0xFFFF);
    Ok(())
}

fn iret_long(state: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Fault> {
    if state.rflags.get_nt() {
        return Err(Fault::gp0());
    }

    // The 64-bit frame always carries all five slots.
    let ip = stack_peek(state, bus, 0, width)?;
    let cs_sel = stack_peek(state, bus, 1, width)? as u16;
    let image = stack_peek(state, bus, 2, width)?;
    let sp = stack_peek(state, bus, 3, width)?;
    let ss_sel = stack_peek(state, bus, 4, width)? as u16;

    if cs_sel & 0xFFFC == 0 {
        return Err(Fault::gp0());
    }
    let rpl = (cs_sel & 3) as u8;
    if rpl < state.cpl() {
        return Err(Fault::gp(sel_code(cs_sel, false)));
    }
    let (lo, hi) = read_gdt_descriptor(state, bus, cs_sel, false)?;
    let target = seg_cache_from_descriptor(cs_sel, lo, hi);
    if !target.is_code() {
        return Err(Fault::gp(sel_code(cs_sel, false)));
    }
    if target.is_conforming() {
        if target.dpl() > rpl {
            return Err(Fault::gp(sel_code(cs_sel, false)));
        }
    } else if target.dpl() != rpl {
        return Err(Fault::gp(sel_code(cs_sel, false)));
    }
    if !target.present() {
        return Err(Fault::np(sel_code(cs_sel, false)));
    }
    if target.long && !mem::canonical(ip) {
        return Err(Fault::gp0());
    }

    let new_ss = if ss_sel & 0xFFFC == 0 {
        // A null SS is legal when returning to 64-bit code below ring 3.
        if rpl == 3 || !target.long {
            return Err(Fault::gp0());
        }
        let mut null_ss = SegmentRegister::null();
        null_ss.selector = ss_sel;
        null_ss
    } else {
        if ss_sel & 3 != u16::from(rpl) {
            return Err(Fault::gp(sel_code(ss_sel, false)));
        }
        let (ss_lo, ss_hi) = read_gdt_descriptor(state, bus, ss_sel, false)?;
        let cache = seg_cache_from_descriptor(ss_sel, ss_lo, ss_hi);
        if !is_writable_data(cache.access) || cache.dpl() != rpl {
            return Err(Fault::gp(sel_code(ss_sel, false)));
        }
        if !cache.present() {
            return Err(Fault::with_code(
                Exception::StackFault,
                sel_code(ss_sel, false),
            ));
        }
        cache
    };

    let outward = rpl > state.cpl();
    let mask = iret_flag_mask(state.cpl(), state.rflags.iopl(), width);

    *state.segment_mut(Seg::Cs) = target;
    *state.segment_mut(Seg::Ss) = new_ss;
    set_popped_sp(state, sp, width);
    state.write_flags(image, mask);
    state.update_mode();
    state.set_rip(ip & width.mask());
    if outward {
        drop_invalid_segments(state);
    }
    Ok(())
}

/// After a return to an outer ring, data segments the new CPL may not hold
/// are forced null.
fn drop_invalid_segments(state: &mut CpuState) {
    let cpl = state.cpl();
    for seg in [Seg::Ds, Seg::Es, Seg::Fs, Seg::Gs] {
        let desc = state.segment(seg);
        if desc.selector & 0xFFFC == 0 {
            continue;
        }
        // Conforming code aside, a segment usable only below the new CPL
        // cannot stay loaded.
        if !desc.is_conforming() && desc.dpl() < cpl {
            *state.segment_mut(seg) = SegmentRegister::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::state::CpuFeatures;
    use quartz_x86::Gpr;

    fn state() -> CpuState {
        CpuState::new(CpuFeatures::all_features())
    }

    fn real_setup(state: &mut CpuState) {
        state.load_segment_real(Seg::Cs, 0x0100);
        state.load_segment_real(Seg::Ss, 0x0000);
        state.write64(Gpr::Rsp.index(), 0x2000);
        state.set_rip(0x42);
    }

    #[test]
    fn real_mode_delivery_frame_and_flag_clears() {
        let mut st = state();
        let mut bus = FlatTestBus::new(0x10000);
        real_setup(&mut st);
        st.assert_if();
        st.assert_tf();
        // Vector 0x21 -> 0x0300:0x0010.
        bus.write_u16(0x21 * 4, 0x0010).unwrap();
        bus.write_u16(0x21 * 4 + 2, 0x0300).unwrap();

        software_interrupt(&mut st, &mut bus, 0x21, InterruptSource::SoftwareInt).unwrap();

        assert_eq!(st.cs().selector, 0x0300);
        assert_eq!(st.cs().base, 0x3000);
        assert_eq!(st.rip(), 0x0010);
        assert!(!st.rflags.get_if());
        assert!(!st.rflags.get_tf());
        assert_eq!(st.read64(Gpr::Rsp.index()), 0x2000 - 6);
        assert_eq!(bus.read_u16(0x2000 - 6).unwrap(), 0x42, "return IP");
        assert_eq!(bus.read_u16(0x2000 - 4).unwrap(), 0x0100, "return CS");
        let flags = bus.read_u16(0x2000 - 2).unwrap();
        assert!(flags & RFLAGS_IF as u16 != 0, "image keeps pre-clear IF");
    }

    #[test]
    fn real_mode_vector_beyond_ivt_limit() {
        let mut st = state();
        let mut bus = FlatTestBus::new(0x10000);
        real_setup(&mut st);
        st.idtr.limit = 0x43;
        let fault =
            software_interrupt(&mut st, &mut bus, 0x11, InterruptSource::SoftwareInt).unwrap_err();
        assert_eq!(fault.exception, Exception::GeneralProtection);
    }

    #[test]
    fn iret_real_round_trip_reopens_nmi_window() {
        let mut st = state();
        let mut bus = FlatTestBus::new(0x10000);
        real_setup(&mut st);
        st.events.mask(EventSet::NMI);

        bus.write_u16(8 * 4, 0x1234).unwrap();
        bus.write_u16(8 * 4 + 2, 0x0200).unwrap();
        software_interrupt(&mut st, &mut bus, 8, InterruptSource::SoftwareInt).unwrap();
        iret(&mut st, &mut bus, Width::W16).unwrap();

        assert_eq!(st.cs().selector, 0x0100);
        assert_eq!(st.rip(), 0x42);
        assert_eq!(st.read64(Gpr::Rsp.index()), 0x2000);
        assert!(!st.events.is_masked(EventSet::NMI));
    }

    #[test]
    fn unreadable_idt_escalates_to_shutdown() {
        let mut st = state();
        let mut bus = FlatTestBus::new(0x10000);
        st.set_cr0(crate::state::CR0_PE);
        // IDT limit 0: every gate read raises #GP, including the ones for
        // #GP itself and then #DF.
        st.idtr.limit = 0;
        deliver_fault(&mut st, &mut bus, Fault::gp0());
        assert_eq!(st.activity, ActivityState::Shutdown);
    }

    #[test]
    fn page_fault_delivery_latches_cr2() {
        let mut st = state();
        let mut bus = FlatTestBus::new(0x10000);
        real_setup(&mut st);
        bus.write_u16(14 * 4, 0x0000).unwrap();
        bus.write_u16(14 * 4 + 2, 0x0500).unwrap();
        deliver_fault(&mut st, &mut bus, Fault::page(0xDEAD_F000, 0x2));
        assert_eq!(st.control.cr2, 0xDEAD_F000);
        assert_eq!(st.cs().selector, 0x0500);
    }

    #[test]
    fn vm86_software_int_needs_iopl_three() {
        let mut st = state();
        let mut bus = FlatTestBus::new(0x10000);
        st.set_cr0(crate::state::CR0_PE);
        st.set_vm(true);
        assert_eq!(st.mode(), CpuMode::Virtual8086);
        st.rflags.set_iopl(2);
        let fault =
            software_interrupt(&mut st, &mut bus, 0x21, InterruptSource::SoftwareInt).unwrap_err();
        assert_eq!(fault.exception, Exception::GeneralProtection);
        assert_eq!(fault.error_code, Some(0));
    }

    fn protected_setup(st: &mut CpuState, bus: &mut FlatTestBus) {
        st.set_cr0(crate::state::CR0_PE);
        st.gdtr.base = 0x100;
        st.gdtr.limit = 0xFF;
        // Entry 1: flat ring-0 code, 32-bit.
        bus.write_u32(0x108, 0x0000_FFFF).unwrap();
        bus.write_u32(0x10C, 0x00CF_9A00).unwrap();
        // Entry 2: flat ring-0 data.
        bus.write_u32(0x110, 0x0000_FFFF).unwrap();
        bus.write_u32(0x114, 0x00CF_9200).unwrap();
        let cs = seg_cache_from_descriptor(0x08, 0x0000_FFFF, 0x00CF_9A00);
        *st.segment_mut(Seg::Cs) = cs;
        let ss = seg_cache_from_descriptor(0x10, 0x0000_FFFF, 0x00CF_9200);
        *st.segment_mut(Seg::Ss) = ss;
        st.update_mode();
        st.write64(Gpr::Rsp.index(), 0x9000);
        st.idtr.base = 0x800;
        st.idtr.limit = 0x7FF;
    }

    fn write_gate32(bus: &mut FlatTestBus, idt_base: u64, vector: u64, offset: u32, trap: bool) {
        let access = if trap { 0x8F00 } else { 0x8E00 };
        bus.write_u32(idt_base + vector * 8, 0x0008_0000 | offset & 0xFFFF)
            .unwrap();
        bus.write_u32(idt_base + vector * 8 + 4, offset & 0xFFFF_0000 | access)
            .unwrap();
    }

    #[test]
    fn protected_interrupt_gate_same_ring() {
        let mut st = state();
        let mut bus = FlatTestBus::new(0x10000);
        protected_setup(&mut st, &mut bus);
        write_gate32(&mut bus, 0x800, 0x20, 0x3000, false);
        st.assert_if();
        st.set_rip(0x4000);

        software_interrupt(&mut st, &mut bus, 0x20, InterruptSource::SoftwareInt).unwrap();

        assert_eq!(st.rip(), 0x3000);
        assert_eq!(st.cs().selector, 0x08);
        assert!(!st.rflags.get_if(), "interrupt gate clears IF");
        assert_eq!(st.read64(Gpr::Rsp.index()), 0x9000 - 12);
        assert_eq!(bus.read_u32(0x9000 - 12).unwrap(), 0x4000);
        assert_eq!(bus.read_u32(0x9000 - 8).unwrap(), 0x08);
        assert!(bus.read_u32(0x9000 - 4).unwrap() & RFLAGS_IF as u32 != 0);
    }

    #[test]
    fn trap_gate_leaves_if() {
        let mut st = state();
        let mut bus = FlatTestBus::new(0x10000);
        protected_setup(&mut st, &mut bus);
        write_gate32(&mut bus, 0x800, 0x21, 0x3100, true);
        st.assert_if();
        software_interrupt(&mut st, &mut bus, 0x21, InterruptSource::SoftwareInt).unwrap();
        assert!(st.rflags.get_if());
    }

    #[test]
    fn gate_dpl_guards_software_but_not_external() {
        let mut st = state();
        let mut bus = FlatTestBus::new(0x10000);
        protected_setup(&mut st, &mut bus);
        write_gate32(&mut bus, 0x800, 0x30, 0x3000, false);
        // Drop to ring 3 via a user code segment.
        bus.write_u32(0x118, 0x0000_FFFF).unwrap();
        bus.write_u32(0x11C, 0x00CF_FA00).unwrap();
        bus.write_u32(0x120, 0x0000_FFFF).unwrap();
        bus.write_u32(0x124, 0x00CF_F200).unwrap();
        *st.segment_mut(Seg::Cs) = seg_cache_from_descriptor(0x1B, 0x0000_FFFF, 0x00CF_FA00);
        *st.segment_mut(Seg::Ss) = seg_cache_from_descriptor(0x23, 0x0000_FFFF, 0x00CF_F200);
        st.update_mode();
        assert_eq!(st.cpl(), 3);
        // TSS for the ring transition.
        st.tr.base = 0x2000;
        st.tr.limit = 0x67;
        bus.write_u32(0x2004, 0x8000).unwrap();
        bus.write_u16(0x2008, 0x10).unwrap();

        let fault = software_interrupt(&mut st, &mut bus, 0x30, InterruptSource::SoftwareInt)
            .unwrap_err();
        assert_eq!(fault.exception, Exception::GeneralProtection);
        assert_eq!(fault.error_code, Some(idt_error_code(0x30)));

        // The same gate accepts a hardware event and switches stacks.
        deliver_external(&mut st, &mut bus, 0x30, InterruptSource::External);
        assert_eq!(st.cpl(), 0);
        assert_eq!(st.ss().selector, 0x10);
        // SS:ESP, EFLAGS, CS, EIP pushed on the ring-0 stack.
        assert_eq!(st.read64(Gpr::Rsp.index()), 0x8000 - 20);
        assert_eq!(bus.read_u32(0x8000 - 4).unwrap(), 0x23, "old SS");
    }
}

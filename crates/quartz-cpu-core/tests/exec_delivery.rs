// Exception-delivery scenarios through the public surface: escalation to
// double fault, shutdown on a broken double-fault gate, and interrupt
// round trips driven by the dispatch engine.

use std::collections::HashMap;

use quartz_cpu_core::events::EventSet;
use quartz_cpu_core::exec::{self, InsnDecoder, StaticVector, StepExit};
use quartz_cpu_core::interrupts::{self, InterruptSource};
use quartz_cpu_core::mem::{CpuBus, FlatTestBus};
use quartz_cpu_core::state::{ActivityState, CpuFeatures, CpuState, SegmentRegister, CR0_PE};
use quartz_cpu_core::{Fault, RunExit};
use quartz_x86::{DecodeError, DecodedInsn, FetchMask, Gpr, InsnKind, Seg, Width};

struct ScriptDecoder(HashMap<u64, DecodedInsn>);

impl ScriptDecoder {
    fn new(program: &[(u64, InsnKind, u8)]) -> Self {
        Self(
            program
                .iter()
                .map(|&(ip, kind, len)| (ip, DecodedInsn::new(kind, len)))
                .collect(),
        )
    }
}

impl InsnDecoder for ScriptDecoder {
    fn decode(
        &self,
        _window: &[u8],
        ip: u64,
        _fetch_mask: FetchMask,
    ) -> Result<DecodedInsn, DecodeError> {
        self.0.get(&ip).copied().ok_or(DecodeError::Undefined)
    }
}

const GDT_BASE: u64 = 0x100;
const IDT_BASE: u64 = 0x800;

fn flat_seg(selector: u16, access: u8) -> SegmentRegister {
    SegmentRegister {
        selector,
        base: 0,
        limit: 0xFFFF_FFFF,
        access,
        long: false,
        db: true,
    }
}

/// Flat ring-0 protected mode with CS=0x08, SS=0x10, and an empty IDT at
/// `IDT_BASE`.
fn protected_setup(bus: &mut FlatTestBus) -> CpuState {
    let mut st = CpuState::new(CpuFeatures::all_features());
    st.set_cr0(CR0_PE);
    st.gdtr.base = GDT_BASE;
    st.gdtr.limit = 0x17;
    // Entry 1: flat ring-0 code. Entry 2: flat ring-0 data.
    bus.write_u32(GDT_BASE + 0x08, 0x0000_FFFF).unwrap();
    bus.write_u32(GDT_BASE + 0x0C, 0x00CF_9A00).unwrap();
    bus.write_u32(GDT_BASE + 0x10, 0x0000_FFFF).unwrap();
    bus.write_u32(GDT_BASE + 0x14, 0x00CF_9200).unwrap();
    *st.segment_mut(Seg::Cs) = flat_seg(0x08, 0x9B);
    *st.segment_mut(Seg::Ss) = flat_seg(0x10, 0x93);
    st.update_mode();
    st.write64(Gpr::Rsp.index(), 0x9000);
    st.idtr.base = IDT_BASE;
    st.idtr.limit = 0x7FF;
    st
}

fn write_gate(bus: &mut FlatTestBus, vector: u64, selector: u16, offset: u32) {
    bus.write_u32(
        IDT_BASE + vector * 8,
        u32::from(selector) << 16 | offset & 0xFFFF,
    )
    .unwrap();
    bus.write_u32(IDT_BASE + vector * 8 + 4, offset & 0xFFFF_0000 | 0x8E00)
        .unwrap();
}

#[test]
fn contributory_fault_during_delivery_escalates_to_double_fault() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut st = protected_setup(&mut bus);
    // The #GP gate names a code selector beyond the GDT limit, so vectoring
    // the first fault raises a second contributory fault.
    write_gate(&mut bus, 13, 0x38, 0x3000);
    write_gate(&mut bus, 8, 0x08, 0x3800);

    interrupts::deliver_fault(&mut st, &mut bus, Fault::gp0());

    assert_eq!(st.rip(), 0x3800, "landed in the double-fault handler");
    assert_eq!(st.cs().selector, 0x08);
    assert_eq!(st.read64(Gpr::Rsp.index()), 0x9000 - 16);
    // The double-fault error code is always zero, EXT included.
    assert_eq!(bus.read_u32(0x9000 - 16).unwrap(), 0);
}

#[test]
fn benign_fault_during_delivery_restarts_as_the_new_exception() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut st = protected_setup(&mut bus);
    // Broken #UD gate, working #GP gate.
    write_gate(&mut bus, 6, 0x38, 0x2000);
    write_gate(&mut bus, 13, 0x08, 0x3000);

    interrupts::deliver_fault(&mut st, &mut bus, Fault::ud());

    // #UD is benign, so the nested #GP replaces it instead of escalating.
    assert_eq!(st.rip(), 0x3000);
    // Error code names the bad selector with the EXT bit set.
    assert_eq!(bus.read_u32(0x9000 - 16).unwrap(), 0x39);
}

#[test]
fn fault_during_double_fault_delivery_shuts_down() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut st = protected_setup(&mut bus);
    // The IDT covers neither #GP nor #DF: the chain runs #GP, #GP, #DF,
    // fails again, and gives up.
    st.idtr.limit = 0x2F;

    interrupts::deliver_fault(&mut st, &mut bus, Fault::gp0());
    assert_eq!(st.activity, ActivityState::Shutdown);

    // Shutdown is terminal for the engine.
    let prog = ScriptDecoder::new(&[]);
    let mut pic = StaticVector(0x20);
    assert_eq!(
        exec::step(&mut st, &mut bus, &prog, &mut pic),
        StepExit::Shutdown
    );
    let result = exec::run(&mut st, &mut bus, &prog, &mut pic, 16);
    assert_eq!(result.exit, RunExit::Shutdown);
    assert_eq!(result.retired, 0);
}

#[test]
fn halt_wakes_for_an_unmasked_interrupt() {
    let mut st = CpuState::new(CpuFeatures::all_features());
    for seg in [Seg::Cs, Seg::Ss, Seg::Ds] {
        st.load_segment_real(seg, 0);
    }
    st.set_rip(0x100);
    st.commit_rip();
    st.write64(Gpr::Rsp.index(), 0x800);
    let mut bus = FlatTestBus::new(0x10000);
    let mut pic = StaticVector(0x20);
    // IVT entry 0x20 -> 0000:0x2000.
    bus.write_u16(0x80, 0x2000).unwrap();
    let prog = ScriptDecoder::new(&[(0x100, InsnKind::Sti, 1), (0x101, InsnKind::Hlt, 1)]);

    let result = exec::run(&mut st, &mut bus, &prog, &mut pic, 10);
    assert_eq!(result.exit, RunExit::Halted);
    assert_eq!(result.retired, 2);
    assert_eq!(st.activity, ActivityState::Halted);

    // Nothing deliverable: the engine stays idle.
    assert_eq!(exec::step(&mut st, &mut bus, &prog, &mut pic), StepExit::Idle);

    // A signaled interrupt wakes the CPU and vectors immediately.
    st.events.signal(EventSet::INTR);
    assert_eq!(
        exec::step(&mut st, &mut bus, &prog, &mut pic),
        StepExit::Interrupted
    );
    assert_eq!(st.rip(), 0x2000);
    assert_eq!(st.activity, ActivityState::Active);
    // The saved frame resumes after the HLT.
    assert_eq!(bus.read_u16(0x800 - 6).unwrap(), 0x102);
}

#[test]
fn protected_interrupt_and_iret_round_trip() {
    let mut bus = FlatTestBus::new(0x10000);
    let mut st = protected_setup(&mut bus);
    write_gate(&mut bus, 0x21, 0x08, 0x3000);
    st.assert_if();
    st.set_rip(0x4000);
    st.commit_rip();

    interrupts::software_interrupt(&mut st, &mut bus, 0x21, InterruptSource::SoftwareInt)
        .unwrap();
    assert_eq!(st.rip(), 0x3000);
    assert!(!st.rflags.get_if(), "interrupt gate closed the window");
    assert_eq!(st.read64(Gpr::Rsp.index()), 0x9000 - 12);

    interrupts::iret(&mut st, &mut bus, Width::W32).unwrap();
    assert_eq!(st.rip(), 0x4000);
    assert_eq!(st.cs().selector, 0x08);
    assert_eq!(st.read64(Gpr::Rsp.index()), 0x9000);
    assert!(st.rflags.get_if(), "flags image restored IF");
}

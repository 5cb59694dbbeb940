//! The dispatch engine: fetch, decode (through the external decoder seam),
//! advance, execute, retire.
//!
//! One `step` is one architectural instruction boundary. Asynchronous events
//! are observed only here, never mid-instruction: the boundary scan services
//! the highest-priority deliverable event before any fetch happens, and a
//! delivered event ends the step so the next boundary is observed fresh.
//! Handler faults never unwind through this layer as errors; the step rolls
//! the instruction pointer back and runs exception delivery itself.

use quartz_x86::{DecodeError, DecodedInsn, FetchMask, Seg};

use crate::events::EventSet;
use crate::exceptions::{Exception, Fault};
use crate::insn;
use crate::interrupts::{self, InterruptSource};
use crate::mem::{self, CpuBus};
use crate::state::{ActivityState, CpuState};

/// Decoder seam. The core hands the decoder a fetched byte window, the
/// address it came from, and the current fetch-legality mask; the decoder
/// owns opcode tables and handler resolution and must reject encodings that
/// are illegal under the mask. Implementations that cache decoded windows
/// must key the cache on the whole mask value and on
/// [`CpuState::prefetch_generation`].
pub trait InsnDecoder {
    fn decode(
        &self,
        window: &[u8],
        ip: u64,
        fetch_mask: FetchMask,
    ) -> Result<DecodedInsn, DecodeError>;
}

/// External interrupt controller seam: acknowledges the pending request and
/// returns its vector. Called exactly once per delivered INTR/LAPIC event.
pub trait InterruptController {
    fn ack(&mut self) -> u8;
}

/// Controller that always acknowledges with one fixed vector. Enough for
/// embedders without a PIC model and for tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticVector(pub u8);

impl InterruptController for StaticVector {
    fn ack(&mut self) -> u8 {
        self.0
    }
}

/// Outcome of one instruction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// One instruction retired.
    Retired,
    /// An asynchronous event was delivered instead of executing.
    Interrupted,
    /// The instruction (or its fetch) raised a fault; delivery has run.
    Faulted,
    /// Halted or waiting for STARTUP, with nothing deliverable.
    Idle,
    /// System-management interrupt surfaced to the embedder.
    Smi,
    /// Triple-fault shutdown; only an external reset leaves this state.
    Shutdown,
}

/// Why a batch ended. An error type because every variant except
/// `Completed` needs the embedder to act before calling `run` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RunExit {
    /// Step budget exhausted.
    #[error("step budget exhausted")]
    Completed,
    #[error("halted waiting for an unmasked event")]
    Halted,
    #[error("waiting for a startup IPI")]
    WaitForSipi,
    #[error("system-management interrupt pending")]
    Smi,
    #[error("triple fault shutdown")]
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub retired: u64,
    pub exit: RunExit,
}

/// Executes one instruction boundary: event service, then at most one
/// fetched/decoded/dispatched instruction.
pub fn step(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    decoder: &dyn InsnDecoder,
    intc: &mut dyn InterruptController,
) -> StepExit {
    if state.activity == ActivityState::Shutdown {
        return StepExit::Shutdown;
    }
    if state.events.async_pending() || state.activity != ActivityState::Active {
        if let Some(exit) = service_events(state, bus, intc) {
            return exit;
        }
        if state.activity != ActivityState::Active {
            return StepExit::Idle;
        }
    }

    // TF at the start of the instruction arms the single-step trap; an
    // instruction that clears TF (POPF, IRET) suppresses it.
    let tf_armed = state.rflags.get_tf();
    let ip = state.rip();
    state.commit_rip();

    let window = match fetch_window(state, bus, ip) {
        Ok(w) => w,
        Err(fault) => return handle_fault(state, bus, fault),
    };
    let decoded = match decoder.decode(&window.bytes[..window.valid], ip, state.fetch_mask()) {
        Ok(d) => d,
        Err(err) => {
            let fault = decode_fault(bus, &window, err);
            return handle_fault(state, bus, fault);
        }
    };
    // The whole encoding must lie inside the code segment, not just its
    // first byte.
    if let Err(fault) = mem::linear(state, Seg::Cs, ip, u32::from(decoded.len)) {
        return handle_fault(state, bus, fault);
    }

    // Advance before dispatch: control-transfer handlers overwrite the
    // pointer, everything else retires at the advanced position.
    state.set_rip(ip.wrapping_add(u64::from(decoded.len)));
    if let Err(fault) = insn::execute(state, bus, &decoded.kind) {
        return handle_fault(state, bus, fault);
    }

    state.icount += 1;
    state.events.retire_tick();
    if tf_armed && state.rflags.get_tf() {
        // Trap class: reports the boundary after the instruction, so no
        // rollback and no RF for the resume.
        interrupts::deliver_fault(state, bus, Fault::new(Exception::Debug));
    }
    state.events.settle(state.rflags.get_tf());
    StepExit::Retired
}

/// Runs up to `max_steps` boundaries.
pub fn run(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    decoder: &dyn InsnDecoder,
    intc: &mut dyn InterruptController,
    max_steps: u64,
) -> RunResult {
    run_with(state, bus, decoder, intc, max_steps, |_| {})
}

/// Like [`run`], invoking `on_retire` after every retired instruction. The
/// hook observes the committed state; it must not assume forward progress
/// between calls (faults and event deliveries retire nothing).
pub fn run_with<F: FnMut(&CpuState)>(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    decoder: &dyn InsnDecoder,
    intc: &mut dyn InterruptController,
    max_steps: u64,
    mut on_retire: F,
) -> RunResult {
    let mut retired = 0;
    for _ in 0..max_steps {
        match step(state, bus, decoder, intc) {
            StepExit::Retired => {
                retired += 1;
                on_retire(state);
                if state.activity == ActivityState::Halted {
                    return RunResult {
                        retired,
                        exit: RunExit::Halted,
                    };
                }
            }
            StepExit::Interrupted | StepExit::Faulted => {}
            StepExit::Idle => {
                let exit = if state.activity == ActivityState::WaitForSipi {
                    RunExit::WaitForSipi
                } else {
                    RunExit::Halted
                };
                return RunResult { retired, exit };
            }
            StepExit::Smi => {
                return RunResult {
                    retired,
                    exit: RunExit::Smi,
                };
            }
            StepExit::Shutdown => {
                return RunResult {
                    retired,
                    exit: RunExit::Shutdown,
                };
            }
        }
    }
    RunResult {
        retired,
        exit: RunExit::Completed,
    }
}

/// Services deliverable events in priority order (bit order). Returns the
/// step exit when servicing ends the boundary; `None` falls through to
/// fetch. Events held by the inhibit shadow or the activity state stay
/// pending.
fn service_events(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    intc: &mut dyn InterruptController,
) -> Option<StepExit> {
    let mut exit = None;
    while let Some(event) = state.events.deliverable().highest_priority() {
        if event == EventSet::SMI {
            state.events.clear(EventSet::SMI);
            exit = Some(StepExit::Smi);
            break;
        } else if event == EventSet::INIT {
            let index = state.cpu_index();
            let carry = state.events.pending() & !EventSet::INIT;
            let sipi = state.events.sipi_vector();
            tracing::debug!(cpu = index, "init received, waiting for startup");
            state.reset(index);
            state.activity = ActivityState::WaitForSipi;
            state.events.signal(carry - EventSet::STARTUP);
            if carry.contains(EventSet::STARTUP) {
                state.events.signal_startup(sipi);
            }
        } else if event == EventSet::STARTUP {
            state.events.clear(EventSet::STARTUP);
            if state.activity == ActivityState::WaitForSipi {
                let vector = state.events.sipi_vector();
                tracing::debug!(cpu = state.cpu_index(), vector, "startup received");
                state.load_segment_real(Seg::Cs, u16::from(vector) << 8);
                state.set_rip(0);
                state.commit_rip();
                state.activity = ActivityState::Active;
            }
        } else if event == EventSet::NMI {
            if state.events.interrupts_inhibited()
                || state.activity == ActivityState::WaitForSipi
            {
                break;
            }
            // Self-masking until the next IRET reopens the window.
            state.events.clear(EventSet::NMI);
            state.events.mask(EventSet::NMI);
            state.activity = ActivityState::Active;
            interrupts::deliver_external(state, bus, 2, InterruptSource::Nmi);
            exit = Some(StepExit::Interrupted);
            break;
        } else {
            debug_assert!(EventSet::IF_GATED.contains(event));
            if state.events.interrupts_inhibited()
                || state.activity == ActivityState::WaitForSipi
            {
                break;
            }
            state.events.clear(event);
            state.activity = ActivityState::Active;
            let vector = intc.ack();
            tracing::trace!(vector, "external interrupt");
            interrupts::deliver_external(state, bus, vector, InterruptSource::External);
            exit = Some(StepExit::Interrupted);
            break;
        }
    }
    state.events.settle(state.rflags.get_tf());
    exit
}

struct FetchWindow {
    bytes: [u8; 15],
    valid: usize,
    base: u64,
}

fn fetch_window(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    ip: u64,
) -> Result<FetchWindow, Fault> {
    let base = mem::linear(state, Seg::Cs, ip, 1)?;
    let (bytes, valid) = bus.fetch(base, 15)?;
    Ok(FetchWindow { bytes, valid, base })
}

/// Maps a decode failure onto the architectural fault. A window cut short by
/// a translation fault re-probes the next byte so the fault carries the
/// right address; a window that was already the maximum encoding length
/// means the instruction itself is overlong.
fn decode_fault(bus: &mut dyn CpuBus, window: &FetchWindow, err: DecodeError) -> Fault {
    match err {
        DecodeError::Undefined => Fault::ud(),
        DecodeError::FetchLimit => {
            if window.valid >= 15 {
                return Fault::gp0();
            }
            match bus.read_u8(window.base.wrapping_add(window.valid as u64)) {
                Err(fault) => fault,
                Ok(_) => Fault::ud(),
            }
        }
    }
}

fn handle_fault(state: &mut CpuState, bus: &mut dyn CpuBus, fault: Fault) -> StepExit {
    state.rollback_rip();
    // RF travels in the saved flags image so the resumed instruction is not
    // re-broken by instruction breakpoints.
    state.assert_rf();
    interrupts::deliver_fault(state, bus, fault);
    StepExit::Faulted
}

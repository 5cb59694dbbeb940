#![forbid(unsafe_code)]

//! Architectural CPU state and instruction execution for Quartz.
//!
//! The crate API centers on [`state::CpuState`], the per-logical-CPU context
//! every operation takes explicitly (there is no process-wide CPU). The
//! dispatch engine ([`exec::step`]/[`exec::run`]) consumes instructions an
//! external decoder has already resolved into [`quartz_x86::InsnKind`] tags,
//! executes them against the state and a [`mem::CpuBus`], and observes
//! asynchronous events only at instruction boundaries. Guest-visible faults
//! travel as [`exceptions::Fault`] values into the delivery machinery in
//! [`interrupts`]; they never unwind through handler code.

pub mod events;
pub mod exceptions;
pub mod exec;
pub mod flags;
pub mod insn;
pub mod interrupts;
pub mod mem;
pub mod mode;
pub mod smp;
pub mod state;

pub use events::{EventSet, Events};
pub use exceptions::{Exception, Fault};
pub use exec::{InsnDecoder, InterruptController, RunExit, RunResult, StepExit};
pub use mem::{CpuBus, FlatTestBus};
pub use mode::CpuMode;
pub use smp::CpuSet;
pub use state::{CpuFeatures, CpuState};

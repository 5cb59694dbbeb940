//! Multi-processor container.
//!
//! One independent engine per logical CPU; index 0 is the bootstrap
//! processor and comes out of reset running, the rest wait for STARTUP.
//! Cores share nothing mutable with each other. Inter-processor signaling
//! goes through each target's pending-event mask; the shared bus is passed
//! per call, never stored.

use crate::events::EventSet;
use crate::exec::{self, InsnDecoder, InterruptController, RunResult, StepExit};
use crate::mem::CpuBus;
use crate::state::{CpuFeatures, CpuState};

pub struct CpuSet {
    cpus: Vec<CpuState>,
}

impl CpuSet {
    /// Builds `count` CPUs with the same feature set, reset to their
    /// architectural start states.
    #[must_use]
    pub fn new(count: usize, features: CpuFeatures) -> Self {
        let cpus = (0..count)
            .map(|index| {
                let mut cpu = CpuState::new(features);
                cpu.reset(index as u32);
                cpu
            })
            .collect();
        Self { cpus }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// The bootstrap processor.
    #[must_use]
    pub fn bsp(&self) -> &CpuState {
        &self.cpus[0]
    }

    #[must_use]
    pub fn cpu(&self, index: usize) -> &CpuState {
        &self.cpus[index]
    }

    pub fn cpu_mut(&mut self, index: usize) -> &mut CpuState {
        &mut self.cpus[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &CpuState> {
        self.cpus.iter()
    }

    /// Signals one CPU.
    pub fn signal(&mut self, index: usize, events: EventSet) {
        self.cpus[index].events.signal(events);
    }

    /// Signals every CPU.
    pub fn signal_all(&mut self, events: EventSet) {
        for cpu in &mut self.cpus {
            cpu.events.signal(events);
        }
    }

    /// Signals every CPU except `sender`, the all-but-self shorthand used
    /// for broadcast IPIs.
    pub fn signal_other(&mut self, sender: usize, events: EventSet) {
        for (index, cpu) in self.cpus.iter_mut().enumerate() {
            if index != sender {
                cpu.events.signal(events);
            }
        }
    }

    /// Sends STARTUP with its page vector to one CPU.
    pub fn startup(&mut self, index: usize, vector: u8) {
        self.cpus[index].events.signal_startup(vector);
    }

    /// Steps one CPU against the shared bus.
    pub fn step(
        &mut self,
        index: usize,
        bus: &mut dyn CpuBus,
        decoder: &dyn InsnDecoder,
        intc: &mut dyn InterruptController,
    ) -> StepExit {
        exec::step(&mut self.cpus[index], bus, decoder, intc)
    }

    /// Runs one CPU for up to `max_steps` boundaries.
    pub fn run(
        &mut self,
        index: usize,
        bus: &mut dyn CpuBus,
        decoder: &dyn InsnDecoder,
        intc: &mut dyn InterruptController,
        max_steps: u64,
    ) -> RunResult {
        exec::run(&mut self.cpus[index], bus, decoder, intc, max_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ActivityState;

    #[test]
    fn bootstrap_runs_and_application_processors_wait() {
        let set = CpuSet::new(4, CpuFeatures::all_features());
        assert_eq!(set.len(), 4);
        assert_eq!(set.bsp().activity, ActivityState::Active);
        for index in 1..4 {
            assert_eq!(set.cpu(index).activity, ActivityState::WaitForSipi);
            assert_eq!(set.cpu(index).cpu_index(), index as u32);
        }
    }

    #[test]
    fn broadcast_skips_the_sender() {
        let mut set = CpuSet::new(3, CpuFeatures::all_features());
        set.signal_other(0, EventSet::NMI);
        assert!(!set.cpu(0).events.is_pending(EventSet::NMI));
        assert!(set.cpu(1).events.is_pending(EventSet::NMI));
        assert!(set.cpu(2).events.is_pending(EventSet::NMI));

        set.signal_all(EventSet::INIT);
        for index in 0..3 {
            assert!(set.cpu(index).events.is_pending(EventSet::INIT));
        }
    }

    #[test]
    fn startup_vector_reaches_only_the_target() {
        let mut set = CpuSet::new(2, CpuFeatures::all_features());
        set.startup(1, 0x42);
        assert!(!set.cpu(0).events.is_pending(EventSet::STARTUP));
        assert!(set.cpu(1).events.is_pending(EventSet::STARTUP));
        assert_eq!(set.cpu(1).events.sipi_vector(), 0x42);
    }
}

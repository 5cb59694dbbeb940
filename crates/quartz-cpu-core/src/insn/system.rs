//! Privileged instructions that touch the run state.

use crate::exceptions::Fault;
use crate::state::{ActivityState, CpuState};

/// Parks the CPU until the next deliverable event. Privileged: outside ring
/// zero this is a protection violation, not a wait.
pub fn hlt(state: &mut CpuState) -> Result<(), Fault> {
    if state.cpl() != 0 {
        return Err(Fault::gp0());
    }
    state.activity = ActivityState::Halted;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::Exception;
    use crate::state::{CpuFeatures, CR0_PE};
    use quartz_x86::Seg;

    #[test]
    fn hlt_parks_ring_zero() {
        let mut st = CpuState::new(CpuFeatures::all_features());
        hlt(&mut st).unwrap();
        assert_eq!(st.activity, ActivityState::Halted);
    }

    #[test]
    fn hlt_faults_outside_ring_zero() {
        let mut st = CpuState::new(CpuFeatures::all_features());
        st.set_cr0(CR0_PE);
        let cs = st.segment_mut(Seg::Cs);
        cs.selector = 0x1B;
        cs.access = 0xFB;
        st.update_mode();

        let fault = hlt(&mut st).unwrap_err();
        assert_eq!(fault.exception, Exception::GeneralProtection);
        assert_eq!(st.activity, ActivityState::Active);
    }
}

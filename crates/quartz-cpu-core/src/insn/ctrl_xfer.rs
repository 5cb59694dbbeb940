//! Near control transfers and the software interrupt family.
//!
//! Far transfers (far CALL/JMP/RET, task switches) are out of scope; the
//! vectoring side of INT n and friends lives in `interrupts`.

use quartz_x86::{Cond, Seg, Width};

use crate::exceptions::Fault;
use crate::flags::Rflags;
use crate::interrupts::{self, InterruptSource};
use crate::mem::{self, CpuBus};
use crate::state::CpuState;

/// Evaluates a branch condition against the current flags. Materializes the
/// lazy shadow as a side effect, which is why it takes `&mut`.
pub(crate) fn condition_met(flags: &mut Rflags, cond: Cond) -> bool {
    match cond {
        Cond::O => flags.get_of(),
        Cond::No => !flags.get_of(),
        Cond::B => flags.get_cf(),
        Cond::Ae => !flags.get_cf(),
        Cond::E => flags.get_zf(),
        Cond::Ne => !flags.get_zf(),
        Cond::Be => flags.get_cf() || flags.get_zf(),
        Cond::A => !flags.get_cf() && !flags.get_zf(),
        Cond::S => flags.get_sf(),
        Cond::Ns => !flags.get_sf(),
        Cond::P => flags.get_pf(),
        Cond::Np => !flags.get_pf(),
        Cond::L => flags.get_sf() != flags.get_of(),
        Cond::Ge => flags.get_sf() == flags.get_of(),
        Cond::Le => flags.get_zf() || flags.get_sf() != flags.get_of(),
        Cond::G => !flags.get_zf() && flags.get_sf() == flags.get_of(),
    }
}

/// Near-branch target validation: canonical in 64-bit mode, within the code
/// segment limit elsewhere. Raised before any architectural state moves.
fn check_branch(state: &CpuState, target: u64) -> Result<(), Fault> {
    if state.mode().is_long64() {
        if !mem::canonical(target) {
            return Err(Fault::gp0());
        }
    } else if target & state.mode().ip_mask() > u64::from(state.cs().limit) {
        return Err(Fault::gp0());
    }
    Ok(())
}

/// Width of the return address pushed by near CALL, and popped by near RET:
/// 64-bit in long mode, otherwise the CS default operand size.
fn return_width(state: &CpuState) -> Width {
    if state.mode().is_long64() {
        Width::W64
    } else if state.cs().db {
        Width::W32
    } else {
        Width::W16
    }
}

pub fn jmp(state: &mut CpuState, target: u64) -> Result<(), Fault> {
    check_branch(state, target)?;
    state.set_rip(target);
    Ok(())
}

pub fn jcc(state: &mut CpuState, cond: Cond, target: u64) -> Result<(), Fault> {
    if condition_met(&mut state.rflags, cond) {
        jmp(state, target)
    } else {
        Ok(())
    }
}

pub fn call(state: &mut CpuState, bus: &mut dyn CpuBus, target: u64) -> Result<(), Fault> {
    check_branch(state, target)?;
    let width = return_width(state);
    let ret = state.rip();
    mem::push(state, bus, width, ret & width.mask())?;
    state.set_rip(target);
    Ok(())
}

/// Near return. The return address is read and validated before RSP moves,
/// so a bad target leaves the stack intact.
pub fn ret_near(state: &mut CpuState, bus: &mut dyn CpuBus, pop: u16) -> Result<(), Fault> {
    let width = return_width(state);
    let smask = mem::sp_mask(state);
    let sp = state.read64(4);
    let ret = mem::read_mem(state, bus, Seg::Ss, sp & smask, width)?;
    check_branch(state, ret)?;
    let new_sp = sp
        .wrapping_add(u64::from(width.bytes()) + u64::from(pop))
        & smask
        | (sp & !smask);
    state.write64(4, new_sp);
    state.set_rip(ret);
    Ok(())
}

pub fn int_n(state: &mut CpuState, bus: &mut dyn CpuBus, vector: u8) -> Result<(), Fault> {
    interrupts::software_interrupt(state, bus, vector, InterruptSource::SoftwareInt)
}

pub fn int3(state: &mut CpuState, bus: &mut dyn CpuBus) -> Result<(), Fault> {
    interrupts::software_interrupt(state, bus, 3, InterruptSource::SoftwareException)
}

pub fn into(state: &mut CpuState, bus: &mut dyn CpuBus) -> Result<(), Fault> {
    if state.mode().is_long64() {
        return Err(Fault::ud());
    }
    if !state.rflags.get_of() {
        return Ok(());
    }
    interrupts::software_interrupt(state, bus, 4, InterruptSource::SoftwareException)
}

/// ICEBP. Vectors like INT 1 but as a privileged source: gate DPL is not
/// checked and the VM86 IOPL restriction does not apply.
pub fn int1(state: &mut CpuState, bus: &mut dyn CpuBus) -> Result<(), Fault> {
    interrupts::software_interrupt(state, bus, 1, InterruptSource::PrivilegedSoftware)
}

pub fn iret(state: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Fault> {
    interrupts::iret(state, bus, width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::Exception;
    use crate::flags::LazyFlags;
    use crate::mem::FlatTestBus;
    use crate::state::{CpuFeatures, EFER_LMA, EFER_LME};
    use quartz_x86::Gpr;

    fn setup() -> (CpuState, FlatTestBus) {
        let mut st = CpuState::new(CpuFeatures::all_features());
        st.load_segment_real(Seg::Cs, 0);
        st.load_segment_real(Seg::Ss, 0);
        st.write64(Gpr::Rsp.index(), 0x800);
        (st, FlatTestBus::new(0x1000))
    }

    #[test]
    fn jcc_signed_and_unsigned_orderings() {
        let (mut st, _) = setup();
        // 5 - 7: borrow, negative, not equal.
        st.rflags.set_lazy(LazyFlags::Sub {
            lhs: 5,
            rhs: 7,
            width: Width::W32,
            result: 5u64.wrapping_sub(7) & 0xFFFF_FFFF,
        });
        assert!(condition_met(&mut st.rflags, Cond::B));
        assert!(condition_met(&mut st.rflags, Cond::L));
        assert!(condition_met(&mut st.rflags, Cond::Ne));
        assert!(!condition_met(&mut st.rflags, Cond::G));

        jcc(&mut st, Cond::L, 0x300).unwrap();
        assert_eq!(st.rip(), 0x300);
        jcc(&mut st, Cond::E, 0x400).unwrap();
        assert_eq!(st.rip(), 0x300, "untaken branch leaves RIP");
    }

    #[test]
    fn jmp_past_code_limit_faults() {
        let (mut st, _) = setup();
        st.segment_mut(Seg::Cs).limit = 0xFF;
        jmp(&mut st, 0x80).unwrap();
        assert_eq!(st.rip(), 0x80);
        let fault = jmp(&mut st, 0x100).unwrap_err();
        assert_eq!(fault.exception, Exception::GeneralProtection);
        assert_eq!(fault.error_code, Some(0));
        assert_eq!(st.rip(), 0x80);
    }

    #[test]
    fn jmp_to_noncanonical_target_faults_in_long_mode() {
        let (mut st, _) = setup();
        st.set_efer(EFER_LME | EFER_LMA);
        st.segment_mut(Seg::Cs).long = true;
        st.update_mode();
        jmp(&mut st, 0x1234_5678_9ABC).unwrap();
        let fault = jmp(&mut st, 1 << 50).unwrap_err();
        assert_eq!(fault.exception, Exception::GeneralProtection);
    }

    #[test]
    fn call_ret_round_trip() {
        let (mut st, mut bus) = setup();
        st.set_rip(0x105);
        call(&mut st, &mut bus, 0x300).unwrap();
        assert_eq!(st.rip(), 0x300);
        assert_eq!(st.read64(Gpr::Rsp.index()), 0x7FE);
        assert_eq!(bus.read_u16(0x7FE).unwrap(), 0x105);

        ret_near(&mut st, &mut bus, 0).unwrap();
        assert_eq!(st.rip(), 0x105);
        assert_eq!(st.read64(Gpr::Rsp.index()), 0x800);
    }

    #[test]
    fn ret_discards_extra_bytes_after_return_address() {
        let (mut st, mut bus) = setup();
        bus.write_u16(0x7F8, 0x222).unwrap();
        st.write64(Gpr::Rsp.index(), 0x7F8);
        ret_near(&mut st, &mut bus, 8).unwrap();
        assert_eq!(st.rip(), 0x222);
        assert_eq!(st.read64(Gpr::Rsp.index()), 0x802);
    }

    #[test]
    fn ret_to_bad_target_leaves_stack_untouched() {
        let (mut st, mut bus) = setup();
        st.segment_mut(Seg::Cs).limit = 0xFF;
        bus.write_u16(0x7FE, 0x4000).unwrap();
        st.write64(Gpr::Rsp.index(), 0x7FE);
        st.set_rip(0x10);
        assert!(ret_near(&mut st, &mut bus, 0).is_err());
        assert_eq!(st.read64(Gpr::Rsp.index()), 0x7FE, "RSP not committed");
        assert_eq!(st.rip(), 0x10);
    }

    #[test]
    fn into_vectors_only_on_overflow() {
        let (mut st, mut bus) = setup();
        // IVT entry 4: handler at 0000:0x2000.
        bus.write_u16(16, 0x2000).unwrap();
        bus.write_u16(18, 0).unwrap();
        st.set_rip(0x50);

        st.rflags.set_of(false);
        into(&mut st, &mut bus).unwrap();
        assert_eq!(st.rip(), 0x50);

        st.rflags.set_of(true);
        into(&mut st, &mut bus).unwrap();
        assert_eq!(st.rip(), 0x2000);
    }

    #[test]
    fn into_is_undefined_in_long_mode() {
        let (mut st, mut bus) = setup();
        st.set_efer(EFER_LME | EFER_LMA);
        st.segment_mut(Seg::Cs).long = true;
        st.update_mode();
        st.rflags.set_of(true);
        let fault = into(&mut st, &mut bus).unwrap_err();
        assert_eq!(fault.exception, Exception::InvalidOpcode);
    }

    #[test]
    fn int3_vectors_through_entry_three() {
        let (mut st, mut bus) = setup();
        bus.write_u16(12, 0x1111).unwrap();
        bus.write_u16(14, 0x100).unwrap();
        st.set_rip(0x42);
        int3(&mut st, &mut bus).unwrap();
        assert_eq!(st.rip(), 0x1111);
        assert_eq!(st.cs().selector, 0x100);
        assert_eq!(st.cs().base, 0x1000);
    }
}

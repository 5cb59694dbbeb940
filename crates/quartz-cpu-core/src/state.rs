//! Architectural CPU state: register banks, segments, control registers,
//! mode bookkeeping, and the flag writes whose side effects reach beyond the
//! flags word.
//!
//! Everything is an explicit instance; nothing in the crate refers to a
//! process-wide CPU. Multi-processor configurations hold one `CpuState` per
//! logical CPU and share nothing but the bus.

use quartz_x86::{FetchMask, Kreg, Reg, Seg, Width};

use crate::events::{Events, EventSet};
use crate::flags::Rflags;
use crate::mode::CpuMode;

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_EM: u64 = 1 << 2;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_AM: u64 = 1 << 18;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_OSFXSR: u64 = 1 << 9;
pub const CR4_OSXSAVE: u64 = 1 << 18;

pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;

pub const XCR0_X87: u64 = 1 << 0;
pub const XCR0_SSE: u64 = 1 << 1;
pub const XCR0_AVX: u64 = 1 << 2;
pub const XCR0_OPMASK: u64 = 1 << 5;
pub const XCR0_ZMM_HI256: u64 = 1 << 6;
pub const XCR0_HI16_ZMM: u64 = 1 << 7;

/// Number of architectural general-purpose registers.
pub const GPR_COUNT: usize = 16;
/// Scratch slot used by handlers for intermediate values.
pub const TMP_REG: usize = 16;
/// Write sink for encodings that name no destination; never read.
pub const NIL_REG: usize = 17;

const GPR_SLOTS: usize = 18;

bitflags::bitflags! {
    /// Feature set fixed at construction. Runtime enablement additionally
    /// honors the CR0/CR4/XCR0 gates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u32 {
        const LONG64 = 1 << 0;
        const SSE = 1 << 1;
        const AVX = 1 << 2;
        const OPMASK = 1 << 3;
    }
}

impl CpuFeatures {
    /// Everything this core models, the common test configuration.
    #[must_use]
    pub fn all_features() -> Self {
        Self::all()
    }
}

bitflags::bitflags! {
    /// Invalidation notices for the embedder's fetch/decode cache, drained
    /// with [`CpuState::take_notifications`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Notify: u32 {
        /// Mode or fetch-legality mask changed; cached decode legality is
        /// stale.
        const MODE_CHANGED = 1 << 0;
        /// The set of unmasked external-interrupt classes changed.
        const INTERRUPT_MASK_CHANGED = 1 << 1;
        /// Alignment checking was switched on or off.
        const ALIGNMENT_CHANGED = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityState {
    #[default]
    Active,
    /// HLT; leaves on the next unmasked event.
    Halted,
    /// Triple fault. Terminal until external reset.
    Shutdown,
    /// Application processor waiting for STARTUP.
    WaitForSipi,
}

/// One cached segment register: the visible selector plus the descriptor
/// fields the core consults. Real mode keeps the cache coherent with the
/// `selector << 4` convention on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    /// Descriptor access byte: P | DPL | S | type.
    pub access: u8,
    /// L attribute: 64-bit code segment.
    pub long: bool,
    /// D/B attribute: 32-bit default operand/stack size.
    pub db: bool,
}

impl SegmentRegister {
    /// Unusable segment: null selector, not present.
    #[must_use]
    pub fn null() -> Self {
        Self {
            selector: 0,
            base: 0,
            limit: 0,
            access: 0,
            long: false,
            db: false,
        }
    }

    #[must_use]
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector,
            base: u64::from(selector) << 4,
            limit: 0xFFFF,
            access: 0x93,
            long: false,
            db: false,
        }
    }

    #[must_use]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    #[must_use]
    pub fn present(&self) -> bool {
        self.access & 0x80 != 0
    }

    #[must_use]
    pub fn is_code(&self) -> bool {
        self.access & 0x18 == 0x18
    }

    #[must_use]
    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access & 0x04 != 0
    }

    #[must_use]
    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

#[derive(Debug, Clone)]
pub struct CpuState {
    gpr: [u64; GPR_SLOTS],
    opmask: [u64; 8],
    rip: u64,
    /// Committed instruction pointer: start of the instruction currently
    /// executing, target of fault rollback.
    prev_rip: u64,
    pub rflags: Rflags,
    segments: [SegmentRegister; 6],
    pub idtr: DescriptorTable,
    pub gdtr: DescriptorTable,
    pub tr: TaskRegister,
    pub control: ControlRegs,
    efer: u64,
    xcr0: u64,
    features: CpuFeatures,
    mode: CpuMode,
    cpl: u8,
    fetch_mask: FetchMask,
    alignment_check: bool,
    pub activity: ActivityState,
    pub events: Events,
    /// Instructions retired since reset.
    pub icount: u64,
    prefetch_generation: u64,
    notify: Notify,
    /// Position in the containing CPU array; index 0 is the bootstrap
    /// processor.
    cpu_index: u32,
}

impl CpuState {
    #[must_use]
    pub fn new(features: CpuFeatures) -> Self {
        let mut state = Self {
            gpr: [0; GPR_SLOTS],
            opmask: [0; 8],
            rip: 0,
            prev_rip: 0,
            rflags: Rflags::default(),
            segments: [SegmentRegister::real_mode(0); 6],
            idtr: DescriptorTable::default(),
            gdtr: DescriptorTable::default(),
            tr: TaskRegister::default(),
            control: ControlRegs::default(),
            efer: 0,
            xcr0: XCR0_X87,
            features,
            mode: CpuMode::Real,
            cpl: 0,
            fetch_mask: FetchMask::empty(),
            alignment_check: false,
            activity: ActivityState::Active,
            events: Events::default(),
            icount: 0,
            prefetch_generation: 0,
            notify: Notify::empty(),
            cpu_index: 0,
        };
        state.reset(0);
        state
    }

    /// Architectural reset. The bootstrap processor comes up running; the
    /// others wait for STARTUP.
    pub fn reset(&mut self, cpu_index: u32) {
        self.cpu_index = cpu_index;
        self.gpr = [0; GPR_SLOTS];
        self.opmask = [0; 8];
        self.rflags = Rflags::default();
        self.control = ControlRegs::default();
        self.efer = 0;
        self.xcr0 = XCR0_X87;
        self.idtr = DescriptorTable {
            base: 0,
            limit: 0x3FF,
        };
        self.gdtr = DescriptorTable::default();
        self.tr = TaskRegister::default();
        for seg in &mut self.segments {
            *seg = SegmentRegister::real_mode(0);
        }
        // Reset vector: the first fetch happens just below 4 GiB.
        let cs = self.segment_mut(Seg::Cs);
        cs.selector = 0xF000;
        cs.base = 0xFFFF_0000;
        cs.access = 0x9B;
        self.rip = 0xFFF0;
        self.prev_rip = self.rip;
        self.cpl = 0;
        self.icount = 0;
        self.events = Events::default();
        self.activity = if cpu_index == 0 {
            ActivityState::Active
        } else {
            ActivityState::WaitForSipi
        };
        // IF starts clear, so the IF-gated classes start masked.
        self.handle_interrupt_mask_change();
        self.update_simd_state();
        self.update_mode();
        self.notify = Notify::empty();
    }

    #[must_use]
    pub fn cpu_index(&self) -> u32 {
        self.cpu_index
    }

    #[must_use]
    pub fn is_bsp(&self) -> bool {
        self.cpu_index == 0
    }

    #[must_use]
    pub fn features(&self) -> CpuFeatures {
        self.features
    }

    // --- general-purpose register file -----------------------------------

    /// 8-bit read. With `extended` addressing (a REX prefix was present)
    /// indices 4..=7 are the low bytes of RSP/RBP/RSI/RDI; without it they
    /// alias the high bytes of the first four registers.
    #[must_use]
    pub fn read8(&self, index: usize, extended: bool) -> u8 {
        let (slot, high) = resolve8(index, extended);
        if high {
            (self.gpr[slot] >> 8) as u8
        } else {
            self.gpr[slot] as u8
        }
    }

    pub fn write8(&mut self, index: usize, extended: bool, value: u8) {
        let (slot, high) = resolve8(index, extended);
        if high {
            self.gpr[slot] = (self.gpr[slot] & !0xFF00) | (u64::from(value) << 8);
        } else {
            self.gpr[slot] = (self.gpr[slot] & !0xFF) | u64::from(value);
        }
    }

    #[must_use]
    pub fn read16(&self, index: usize) -> u16 {
        self.gpr[index] as u16
    }

    pub fn write16(&mut self, index: usize, value: u16) {
        self.gpr[index] = (self.gpr[index] & !0xFFFF) | u64::from(value);
    }

    #[must_use]
    pub fn read32(&self, index: usize) -> u32 {
        self.gpr[index] as u32
    }

    /// 32-bit writes zero-extend into the full register; the upper half is
    /// never separately addressable.
    pub fn write32(&mut self, index: usize, value: u32) {
        self.gpr[index] = u64::from(value);
    }

    #[must_use]
    pub fn read64(&self, index: usize) -> u64 {
        self.gpr[index]
    }

    pub fn write64(&mut self, index: usize, value: u64) {
        self.gpr[index] = value;
    }

    /// Width-dispatching read of a resolved register operand; the value
    /// comes back zero-extended to 64 bits.
    #[must_use]
    pub fn read_reg(&self, reg: Reg) -> u64 {
        match reg.width {
            Width::W8 => {
                if reg.high8 {
                    u64::from(self.read8(reg.gpr.index() + 4, false))
                } else {
                    u64::from(self.read8(reg.gpr.index(), true))
                }
            }
            Width::W16 => u64::from(self.read16(reg.gpr.index())),
            Width::W32 => u64::from(self.read32(reg.gpr.index())),
            Width::W64 => self.read64(reg.gpr.index()),
        }
    }

    pub fn write_reg(&mut self, reg: Reg, value: u64) {
        match reg.width {
            Width::W8 => {
                if reg.high8 {
                    self.write8(reg.gpr.index() + 4, false, value as u8);
                } else {
                    self.write8(reg.gpr.index(), true, value as u8);
                }
            }
            Width::W16 => self.write16(reg.gpr.index(), value as u16),
            Width::W32 => self.write32(reg.gpr.index(), value as u32),
            Width::W64 => self.write64(reg.gpr.index(), value),
        }
    }

    // --- opmask register file --------------------------------------------

    /// Width-projected opmask read.
    #[must_use]
    pub fn mask_read(&self, reg: Kreg, width: Width) -> u64 {
        self.opmask[reg.index()] & width.mask()
    }

    /// Opmask writes replace the whole register with the zero-extended
    /// width-sized value; no partial-register merge exists for masks.
    pub fn mask_write(&mut self, reg: Kreg, width: Width, value: u64) {
        self.opmask[reg.index()] = value & width.mask();
    }

    #[must_use]
    pub fn mask_read64(&self, reg: Kreg) -> u64 {
        self.opmask[reg.index()]
    }

    pub fn mask_write64(&mut self, reg: Kreg, value: u64) {
        self.opmask[reg.index()] = value;
    }

    // --- instruction pointer ---------------------------------------------

    #[must_use]
    pub fn rip(&self) -> u64 {
        self.rip
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip & self.mode.ip_mask();
    }

    /// Start address of the instruction currently executing.
    #[must_use]
    pub fn committed_rip(&self) -> u64 {
        self.prev_rip
    }

    /// Marks the current IP as the retirement point for the next
    /// instruction.
    pub fn commit_rip(&mut self) {
        self.prev_rip = self.rip;
    }

    /// Rolls back to the committed IP; the faulting instruction never
    /// happened.
    pub fn rollback_rip(&mut self) {
        self.rip = self.prev_rip;
    }

    // --- segments ---------------------------------------------------------

    #[must_use]
    pub fn segment(&self, seg: Seg) -> &SegmentRegister {
        &self.segments[seg as usize]
    }

    pub fn segment_mut(&mut self, seg: Seg) -> &mut SegmentRegister {
        &mut self.segments[seg as usize]
    }

    #[must_use]
    pub fn cs(&self) -> &SegmentRegister {
        self.segment(Seg::Cs)
    }

    #[must_use]
    pub fn ss(&self) -> &SegmentRegister {
        self.segment(Seg::Ss)
    }

    /// Real-mode segment load: cache follows the selector.
    pub fn load_segment_real(&mut self, seg: Seg, selector: u16) {
        *self.segment_mut(seg) = SegmentRegister::real_mode(selector);
        if seg == Seg::Cs {
            self.segment_mut(Seg::Cs).access = 0x9B;
            self.update_mode();
        }
    }

    // --- privilege and mode ----------------------------------------------

    #[must_use]
    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    /// Ring 3, including virtual-8086.
    #[must_use]
    pub fn user_pl(&self) -> bool {
        self.cpl == 3
    }

    #[must_use]
    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    #[must_use]
    pub fn long_mode_active(&self) -> bool {
        self.efer & EFER_LMA != 0
    }

    #[must_use]
    pub fn efer(&self) -> u64 {
        self.efer
    }

    pub fn set_efer(&mut self, value: u64) {
        self.efer = value;
        self.update_mode();
    }

    #[must_use]
    pub fn xcr0(&self) -> u64 {
        self.xcr0
    }

    pub fn set_xcr0(&mut self, value: u64) {
        self.xcr0 = value | XCR0_X87;
        self.update_simd_state();
    }

    pub fn set_cr0(&mut self, value: u64) {
        let old = self.control.cr0;
        self.control.cr0 = value;
        if (old ^ value) & CR0_PE != 0 {
            self.update_mode();
        }
        if (old ^ value) & CR0_AM != 0 {
            self.handle_alignment_check();
        }
        if (old ^ value) & (CR0_EM | CR0_TS | CR0_MP) != 0 {
            self.update_simd_state();
        }
    }

    pub fn set_cr4(&mut self, value: u64) {
        self.control.cr4 = value;
        self.update_simd_state();
    }

    /// Re-derives the cached mode from (CR0.PE, RFLAGS.VM, EFER.LMA, CS.L).
    /// Every mutation of one of the four inputs must call this; nothing
    /// recomputes on read.
    pub fn update_mode(&mut self) {
        let old = self.mode;
        let pe = self.control.cr0 & CR0_PE != 0;
        let vm = self.rflags.get_vm();
        let lma = self.long_mode_active();
        let cs_long = self.cs().long;
        self.mode = CpuMode::derive(pe, vm, lma, cs_long);

        match self.mode {
            CpuMode::Real => {
                self.cpl = 0;
            }
            CpuMode::Virtual8086 => {
                self.cpl = 3;
            }
            CpuMode::Protected | CpuMode::LongCompat | CpuMode::Long64 => {
                self.cpl = self.cs().rpl();
            }
        }

        if old == CpuMode::Long64 && self.mode != CpuMode::Long64 {
            // The upper halves of RIP and RSP are unreachable outside the
            // 64-bit submode.
            self.rip &= 0xFFFF_FFFF;
            self.prev_rip &= 0xFFFF_FFFF;
            self.gpr[4] &= 0xFFFF_FFFF;
        }

        self.handle_alignment_check();
        self.update_fetch_mask();

        if old != self.mode {
            tracing::debug!(from = %old, to = %self.mode, "cpu mode change");
            self.notify |= Notify::MODE_CHANGED;
        }
    }

    /// Recomputes the SIMD-enable gates after a CR0/CR4/XCR0 write.
    pub fn update_simd_state(&mut self) {
        self.update_fetch_mask();
    }

    fn simd_gates(&self) -> FetchMask {
        let mut mask = FetchMask::empty();
        let cr0 = self.control.cr0;
        let sse_ok =
            self.features.contains(CpuFeatures::SSE) && cr0 & CR0_EM == 0 && cr0 & CR0_TS == 0;
        if sse_ok {
            mask |= FetchMask::SSE_OK;
        }
        let xsave = self.control.cr4 & CR4_OSXSAVE != 0;
        let avx_ok = sse_ok
            && self.features.contains(CpuFeatures::AVX)
            && xsave
            && self.xcr0 & (XCR0_SSE | XCR0_AVX) == (XCR0_SSE | XCR0_AVX);
        if avx_ok {
            mask |= FetchMask::AVX_OK;
        }
        let opmask_ok = avx_ok
            && self.features.contains(CpuFeatures::OPMASK)
            && self.xcr0 & XCR0_OPMASK != 0;
        if opmask_ok {
            mask |= FetchMask::OPMASK_OK;
        }
        let evex_ok = opmask_ok
            && self.xcr0 & (XCR0_ZMM_HI256 | XCR0_HI16_ZMM) == (XCR0_ZMM_HI256 | XCR0_HI16_ZMM);
        if evex_ok {
            mask |= FetchMask::EVEX_OK;
        }
        mask
    }

    fn update_fetch_mask(&mut self) {
        let mut mask = self.simd_gates();
        if self.cs().db {
            mask |= FetchMask::D32;
        }
        if self.mode.is_long64() {
            mask |= FetchMask::LONG64;
        }
        if mask != self.fetch_mask {
            self.fetch_mask = mask;
            self.notify |= Notify::MODE_CHANGED;
        }
    }

    #[must_use]
    pub fn fetch_mask(&self) -> FetchMask {
        self.fetch_mask
    }

    #[must_use]
    pub fn opmask_enabled(&self) -> bool {
        self.fetch_mask.contains(FetchMask::OPMASK_OK)
    }

    // --- flag writes with side effects -----------------------------------

    /// TF write. Setting it arms the boundary check unconditionally so
    /// single-step is observed even if it was already set.
    pub fn set_tf(&mut self, value: bool) {
        self.rflags.set_tf_raw(value);
        if value {
            self.events.arm();
        }
    }

    pub fn assert_tf(&mut self) {
        self.set_tf(true);
    }

    pub fn clear_tf(&mut self) {
        self.set_tf(false);
    }

    /// IF write: regates the external-interrupt event classes.
    pub fn set_if(&mut self, value: bool) {
        let old = self.rflags.get_if();
        self.rflags.set_if_raw(value);
        self.handle_interrupt_mask_change();
        if old != value {
            self.notify |= Notify::INTERRUPT_MASK_CHANGED;
        }
    }

    pub fn assert_if(&mut self) {
        self.set_if(true);
    }

    pub fn clear_if(&mut self) {
        self.set_if(false);
    }

    fn handle_interrupt_mask_change(&mut self) {
        if self.rflags.get_if() {
            self.events.unmask(EventSet::IF_GATED);
        } else {
            self.events.mask(EventSet::IF_GATED);
        }
    }

    /// RF write: the prefetch window is invalidated before the change takes
    /// effect so a stale window cannot carry the old value.
    pub fn set_rf(&mut self, value: bool) {
        self.invalidate_prefetch();
        self.rflags.set_rf_raw(value);
    }

    pub fn assert_rf(&mut self) {
        self.set_rf(true);
    }

    pub fn clear_rf(&mut self) {
        self.set_rf(false);
    }

    /// AC write: re-derives whether alignment checking is enforced.
    pub fn set_ac(&mut self, value: bool) {
        self.rflags.set_ac_raw(value);
        self.handle_alignment_check();
    }

    fn handle_alignment_check(&mut self) {
        let enabled = self.cpl == 3 && self.control.cr0 & CR0_AM != 0 && self.rflags.get_ac();
        if enabled != self.alignment_check {
            self.alignment_check = enabled;
            self.notify |= Notify::ALIGNMENT_CHANGED;
        }
    }

    #[must_use]
    pub fn alignment_check_enabled(&self) -> bool {
        self.alignment_check
    }

    /// VM write. A documented no-op while long mode is active; otherwise a
    /// real change re-derives the mode.
    pub fn set_vm(&mut self, value: bool) {
        if self.long_mode_active() {
            return;
        }
        if self.rflags.get_vm() != value {
            self.rflags.set_vm_raw(value);
            self.update_mode();
        }
    }

    /// Whole-word flags write (POPF, IRET, delivery). Applies `change_mask`
    /// and routes the side-effect flags through their handlers.
    pub fn write_flags(&mut self, value: u64, change_mask: u64) {
        let old_if = self.rflags.get_if();
        let old_vm = self.rflags.get_vm();
        let old_ac = self.rflags.get_ac();
        let old_rf = self.rflags.get_rf();

        self.rflags.write_masked(value, change_mask);

        if self.rflags.get_tf() {
            self.events.arm();
        }
        if self.rflags.get_if() != old_if {
            self.handle_interrupt_mask_change();
            self.notify |= Notify::INTERRUPT_MASK_CHANGED;
        }
        if self.rflags.get_rf() != old_rf {
            self.invalidate_prefetch();
        }
        if self.rflags.get_ac() != old_ac {
            self.handle_alignment_check();
        }
        if self.rflags.get_vm() != old_vm {
            self.update_mode();
        }
    }

    // --- external invalidation surfaces ----------------------------------

    pub fn invalidate_prefetch(&mut self) {
        self.prefetch_generation += 1;
    }

    #[must_use]
    pub fn prefetch_generation(&self) -> u64 {
        self.prefetch_generation
    }

    /// Drains accumulated decode-cache invalidation notices.
    pub fn take_notifications(&mut self) -> Notify {
        core::mem::take(&mut self.notify)
    }
}

/// Maps an 8-bit register encoding to (bank slot, high-byte?).
fn resolve8(index: usize, extended: bool) -> (usize, bool) {
    if !extended && (4..8).contains(&index) {
        (index - 4, true)
    } else {
        (index, false)
    }
}

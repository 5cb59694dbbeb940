//! Asynchronous event bookkeeping.
//!
//! Devices, timers, and other CPUs signal events at any time; the core
//! observes them only at instruction boundaries, through the `async_event`
//! indicator. An event is deliverable when it is signaled and not masked.
//! Bit identifiers double as delivery priority: the boundary scan services
//! the lowest set deliverable bit first.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventSet: u32 {
        /// System-management interrupt. Delivery is the embedder's problem;
        /// the core only surfaces it (SMM is not modeled here).
        const SMI = 1 << 0;
        /// Inter-processor INIT: returns the target to wait-for-startup.
        const INIT = 1 << 1;
        /// Inter-processor STARTUP with an 8-bit page vector; only
        /// deliverable while waiting for startup.
        const STARTUP = 1 << 2;
        /// Non-maskable interrupt. Self-masking: delivery masks the event
        /// class until the next IRET.
        const NMI = 1 << 3;
        /// External interrupt line (PIC). Masked while RFLAGS.IF is clear;
        /// the vector is acknowledged from the interrupt controller at
        /// delivery time.
        const INTR = 1 << 4;
        /// Local-APIC-delivered interrupt. Same gating as `INTR`.
        const LAPIC = 1 << 5;
    }
}

impl EventSet {
    /// The event classes gated by RFLAGS.IF.
    pub const IF_GATED: EventSet = EventSet::INTR.union(EventSet::LAPIC);

    /// Lowest set bit, as a single-bit set. Priority order is bit order.
    #[must_use]
    pub fn highest_priority(self) -> Option<EventSet> {
        if self.is_empty() {
            return None;
        }
        EventSet::from_bits(1 << self.bits().trailing_zeros())
    }
}

/// Pending/masked event state plus the boundary-check indicator.
///
/// All mutators are idempotent bitmask edits; signaling an already-pending
/// event or masking an already-masked one is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Events {
    pending: EventSet,
    masked: EventSet,
    /// Set whenever something may need service at the next instruction
    /// boundary: a deliverable event, or single-step trace arming. Cleared
    /// only by the boundary check once nothing remains deliverable.
    async_event: bool,
    /// Startup page vector latched by the most recent STARTUP signal.
    sipi_vector: u8,
    /// Retirements remaining before interrupt delivery is allowed again
    /// (STI / mov-ss shadow).
    inhibit: u8,
}

impl Events {
    pub fn signal(&mut self, events: EventSet) {
        self.pending |= events;
        if self.pending.intersects(!self.masked) {
            self.async_event = true;
        }
    }

    pub fn signal_startup(&mut self, vector: u8) {
        self.sipi_vector = vector;
        self.signal(EventSet::STARTUP);
    }

    pub fn clear(&mut self, events: EventSet) {
        self.pending &= !events;
    }

    pub fn mask(&mut self, events: EventSet) {
        self.masked |= events;
    }

    /// Unmasking re-arms the boundary check if the event is still signaled;
    /// a device that signaled while masked is not lost.
    pub fn unmask(&mut self, events: EventSet) {
        self.masked &= !events;
        if self.pending.intersects(!self.masked) {
            self.async_event = true;
        }
    }

    #[must_use]
    pub fn is_pending(&self, events: EventSet) -> bool {
        self.pending.intersects(events)
    }

    #[must_use]
    pub fn pending(&self) -> EventSet {
        self.pending
    }

    #[must_use]
    pub fn is_masked(&self, events: EventSet) -> bool {
        self.masked.contains(events)
    }

    #[must_use]
    pub fn deliverable(&self) -> EventSet {
        self.pending & !self.masked
    }

    #[must_use]
    pub fn sipi_vector(&self) -> u8 {
        self.sipi_vector
    }

    #[must_use]
    pub fn async_pending(&self) -> bool {
        self.async_event
    }

    /// Arms the boundary check unconditionally (trace trap, explicit kick).
    pub fn arm(&mut self) {
        self.async_event = true;
    }

    /// Re-derives the indicator after boundary servicing. `keep` forces it
    /// to stay armed (single-step wants every boundary observed).
    pub fn settle(&mut self, keep: bool) {
        self.async_event = keep || !self.deliverable().is_empty() || self.inhibit > 0;
    }

    /// Suppresses IF-gated delivery until one more instruction has retired.
    /// The count is two because the inhibiting instruction's own retirement
    /// consumes the first tick.
    pub fn inhibit_interrupts(&mut self) {
        self.inhibit = 2;
        // Keep the boundary check live so the window closes promptly.
        self.async_event = true;
    }

    #[must_use]
    pub fn interrupts_inhibited(&self) -> bool {
        self.inhibit > 0
    }

    pub fn retire_tick(&mut self) {
        if self.inhibit > 0 {
            self.inhibit -= 1;
        }
    }

    /// Drops volatile event state on INIT while keeping external mask
    /// configuration intact.
    pub fn reset_pending(&mut self) {
        self.pending = EventSet::empty();
        self.async_event = false;
        self.inhibit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_arms_only_when_unmasked() {
        let mut ev = Events::default();
        ev.mask(EventSet::INTR);
        ev.signal(EventSet::INTR);
        assert!(!ev.async_pending());
        assert!(ev.is_pending(EventSet::INTR));
        assert!(ev.deliverable().is_empty());

        ev.signal(EventSet::NMI);
        assert!(ev.async_pending());
    }

    #[test]
    fn unmask_rearms_still_signaled_event() {
        let mut ev = Events::default();
        ev.mask(EventSet::INTR);
        ev.signal(EventSet::INTR);
        ev.settle(false);
        assert!(!ev.async_pending());

        ev.unmask(EventSet::INTR);
        assert!(ev.async_pending());
        assert_eq!(ev.deliverable(), EventSet::INTR);
    }

    #[test]
    fn mutators_are_idempotent() {
        let mut ev = Events::default();
        ev.signal(EventSet::NMI);
        ev.signal(EventSet::NMI);
        assert_eq!(ev.deliverable(), EventSet::NMI);
        ev.clear(EventSet::NMI);
        ev.clear(EventSet::NMI);
        assert!(ev.deliverable().is_empty());
        ev.mask(EventSet::SMI);
        ev.mask(EventSet::SMI);
        assert!(ev.is_masked(EventSet::SMI));
    }

    #[test]
    fn priority_is_bit_order() {
        let set = EventSet::NMI | EventSet::INTR | EventSet::SMI;
        assert_eq!(set.highest_priority(), Some(EventSet::SMI));
        let set = EventSet::LAPIC | EventSet::NMI;
        assert_eq!(set.highest_priority(), Some(EventSet::NMI));
        assert_eq!(EventSet::empty().highest_priority(), None);
    }

    #[test]
    fn inhibit_window_spans_one_retirement() {
        let mut ev = Events::default();
        ev.inhibit_interrupts();
        assert!(ev.interrupts_inhibited());
        // The inhibiting instruction itself retires...
        ev.retire_tick();
        assert!(ev.interrupts_inhibited());
        // ...and the window closes after the next one.
        ev.retire_tick();
        assert!(!ev.interrupts_inhibited());
    }
}

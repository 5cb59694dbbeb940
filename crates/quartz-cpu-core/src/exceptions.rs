//! Exception vectors, fault classification, and the raise channel.
//!
//! Guest-visible faults never unwind through handler code: a handler that
//! detects a fault constructs a [`Fault`] and returns it as the `Err` arm of
//! its result, doing no further work. Only the dispatch loop (and the
//! delivery machinery itself, for faults raised while pushing an exception
//! frame) ever consumes one.

/// Architectural exception vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Exception {
    DivideError = 0,
    Debug = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRange = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    FpError = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdError = 19,
    VirtualizationError = 20,
    ControlProtection = 21,
}

/// Escalation class of an exception, deciding whether a second exception
/// raised during delivery of a first becomes a double fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Benign,
    Contributory,
    PageFault,
}

impl Exception {
    #[must_use]
    pub fn vector(self) -> u8 {
        self as u8
    }

    /// Whether delivery through a protected-mode or long-mode gate pushes an
    /// error code for this vector. Real-mode delivery never pushes one.
    #[must_use]
    pub fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection
                | Exception::PageFault
                | Exception::AlignmentCheck
                | Exception::ControlProtection
        )
    }

    #[must_use]
    pub fn class(self) -> FaultClass {
        match self {
            Exception::DivideError
            | Exception::InvalidTss
            | Exception::SegmentNotPresent
            | Exception::StackFault
            | Exception::GeneralProtection => FaultClass::Contributory,
            Exception::PageFault => FaultClass::PageFault,
            _ => FaultClass::Benign,
        }
    }

    /// Trap-class exceptions report the boundary after the trapping
    /// instruction; fault-class exceptions roll the instruction pointer back
    /// to the start of the faulting instruction.
    #[must_use]
    pub fn is_trap(self) -> bool {
        matches!(self, Exception::Breakpoint | Exception::Overflow)
    }
}

/// Whether a `second` exception raised while delivering `first` may be
/// delivered on its own, or must escalate to a double fault.
#[must_use]
pub fn should_double_fault(first: FaultClass, second: FaultClass) -> bool {
    match (first, second) {
        (FaultClass::Contributory, FaultClass::Contributory) => true,
        (FaultClass::PageFault, FaultClass::Contributory) => true,
        (FaultClass::PageFault, FaultClass::PageFault) => true,
        _ => false,
    }
}

/// A raised guest-visible fault, carried as an error value up to the
/// dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub exception: Exception,
    /// Pushed by the delivery machinery when the vector calls for one.
    pub error_code: Option<u16>,
    /// Faulting linear address, for page faults only; latched into CR2.
    pub addr: Option<u64>,
}

impl Fault {
    #[must_use]
    pub fn new(exception: Exception) -> Self {
        Self {
            exception,
            error_code: None,
            addr: None,
        }
    }

    #[must_use]
    pub fn with_code(exception: Exception, error_code: u16) -> Self {
        Self {
            exception,
            error_code: Some(error_code),
            addr: None,
        }
    }

    #[must_use]
    pub fn ud() -> Self {
        Self::new(Exception::InvalidOpcode)
    }

    #[must_use]
    pub fn de() -> Self {
        Self::new(Exception::DivideError)
    }

    /// `#GP(0)`, the catch-all protection violation.
    #[must_use]
    pub fn gp0() -> Self {
        Self::with_code(Exception::GeneralProtection, 0)
    }

    /// `#GP` referencing a selector (low three bits of the error code are
    /// the TI/IDT/EXT flags filled in by the raiser).
    #[must_use]
    pub fn gp(error_code: u16) -> Self {
        Self::with_code(Exception::GeneralProtection, error_code)
    }

    #[must_use]
    pub fn ss0() -> Self {
        Self::with_code(Exception::StackFault, 0)
    }

    #[must_use]
    pub fn np(error_code: u16) -> Self {
        Self::with_code(Exception::SegmentNotPresent, error_code)
    }

    /// `#AC(0)`; alignment faults always push a zero error code.
    #[must_use]
    pub fn ac0() -> Self {
        Self::with_code(Exception::AlignmentCheck, 0)
    }

    #[must_use]
    pub fn page(addr: u64, error_code: u16) -> Self {
        Self {
            exception: Exception::PageFault,
            error_code: Some(error_code),
            addr: Some(addr),
        }
    }

    #[must_use]
    pub fn double() -> Self {
        Self::with_code(Exception::DoubleFault, 0)
    }
}

/// Error-code selector reference into the IDT: `vector * 8 | 2`, with bit 0
/// (EXT) ORed in by the caller when the event was externally caused.
#[must_use]
pub fn idt_error_code(vector: u8) -> u16 {
    u16::from(vector) << 3 | 2
}

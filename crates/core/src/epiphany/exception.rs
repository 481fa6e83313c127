use std::fmt;

use epiphany_hal::regs;

/// GDB target signal numbers, as defined by the GDB sources. Only the ones
/// this server ever reports are named.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetSignal {
    None = 0,
    Hup = 1,
    Int = 2,
    Quit = 3,
    Ill = 4,
    Trap = 5,
    Abrt = 6,
    Emt = 7,
    Fpe = 8,
    Kill = 9,
    Bus = 10,
    Segv = 11,
}

impl TargetSignal {
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// Exception cause latched in STATUS[18:16].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoreException {
    None,

    /// Unaligned load or store
    UnalignedAccess,

    /// Floating point fault
    FpuFault,

    /// Unimplemented instruction
    Unimplemented,

    /// Any other non-zero cause
    Other(u32),
}

impl CoreException {
    pub fn from_status(status: u32) -> CoreException {
        use CoreException::*;
        match (status >> regs::STATUS_EXCAUSE_SHIFT) & regs::STATUS_EXCAUSE_MASK {
            0 => None,
            0x2 => UnalignedAccess,
            0x3 => FpuFault,
            0x4 => Unimplemented,
            other => Other(other),
        }
    }

    /// The stop signal reported for this exception, if any.
    pub fn signal(self) -> Option<TargetSignal> {
        use CoreException::*;
        match self {
            None => Option::None,
            UnalignedAccess => Some(TargetSignal::Bus),
            FpuFault => Some(TargetSignal::Fpe),
            Unimplemented => Some(TargetSignal::Ill),
            Other(_) => Some(TargetSignal::Abrt),
        }
    }
}

impl fmt::Display for CoreException {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        use CoreException::*;
        match *self {
            None => write!(f, "no exception"),
            UnalignedAccess => write!(f, "unaligned load/store"),
            FpuFault => write!(f, "floating point fault"),
            Unimplemented => write!(f, "unimplemented instruction"),
            Other(cause) => write!(f, "exception cause 0x{:x}", cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_field_maps_to_signals() {
        assert_eq!(CoreException::from_status(0).signal(), None);
        assert_eq!(
            CoreException::from_status(0x2 << 16).signal(),
            Some(TargetSignal::Bus)
        );
        assert_eq!(
            CoreException::from_status(0x3 << 16).signal(),
            Some(TargetSignal::Fpe)
        );
        assert_eq!(
            CoreException::from_status(0x4 << 16).signal(),
            Some(TargetSignal::Ill)
        );
        assert_eq!(
            CoreException::from_status(0x7 << 16).signal(),
            Some(TargetSignal::Abrt)
        );
    }

    #[test]
    fn low_status_bits_do_not_leak_into_the_cause() {
        let status = regs::STATUS_ACTIVE | regs::STATUS_GID;
        assert_eq!(CoreException::from_status(status), CoreException::None);
    }
}

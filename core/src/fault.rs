//! Fault frames delivered to the guest.

/// Fault status bit marking an expropriation notification.
pub const FAULT_STATUS_EXPROPRIATED: u64 = 1 << 5;

/// Machine state: problem (user) state.
pub const MSR_PR: u64 = 1 << 14;
/// Machine state: hypervisor state.
pub const MSR_HV: u64 = 1 << 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultFrame {
    /// Faulting guest address.
    pub addr: u64,
    /// Fault status register.
    pub status: u64,
    /// Machine state at the time of the fault.
    pub msr: u64,
}

impl FaultFrame {
    /// An expropriation fault injected while the vcpu ran with `msr`.
    pub fn expropriation(addr: u64, msr: u64) -> Self {
        Self {
            addr,
            status: FAULT_STATUS_EXPROPRIATED,
            msr,
        }
    }

    pub fn is_expropriation(&self) -> bool {
        self.status & FAULT_STATUS_EXPROPRIATED != 0
    }

    /// Taken in supervisor mode, by the same test the issuer applies at
    /// admission.
    pub fn is_privileged(&self) -> bool {
        msr_is_privileged(self.msr)
    }
}

/// A fault taken with both the problem-state and hypervisor bits clear.
pub fn msr_is_privileged(msr: u64) -> bool {
    msr & (MSR_PR | MSR_HV) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expropriation_bit() {
        let f = FaultFrame::expropriation(0x4000, MSR_PR);
        assert!(f.is_expropriation());
        assert!(!f.is_privileged());
        assert!(!FaultFrame::default().is_expropriation());
    }

    #[test]
    fn test_frame_privilege_matches_admission() {
        for msr in [0, MSR_PR, MSR_HV, MSR_PR | MSR_HV] {
            let f = FaultFrame::expropriation(0, msr);
            assert_eq!(f.is_privileged(), msr_is_privileged(msr), "msr {msr:#x}");
        }
        assert!(FaultFrame::expropriation(0, 0).is_privileged());
    }

    #[test]
    fn test_privileged_msr() {
        assert!(msr_is_privileged(0));
        assert!(!msr_is_privileged(MSR_PR));
        assert!(!msr_is_privileged(MSR_HV));
    }
}

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("invalid region length: {0}")]
    InvalidLength(usize),

    #[error("region already attached at {0:#x}")]
    AlreadyAttached(u64),

    #[error("failed to pin guest range {gpa:#x}+{len:#x}")]
    PinFailed { gpa: u64, len: usize },

    #[error("guest address {0:#x} is not aligned")]
    Misaligned(u64),

    #[error("invalid guest memory size: {0}")]
    InvalidMemorySize(usize),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcallError {
    #[error("hypervisor rejected the call (status {0})")]
    HypervisorRejected(i64),

    #[error("hypercall not supported")]
    Unsupported,

    #[error("hypercall returned out-of-range value {0:#x}")]
    InvalidReturn(u64),
}

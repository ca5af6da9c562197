use esn_core::RegionError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("no such vcpu: {0}")]
    NoSuchVcpu(u32),

    #[error("ESN facility not enabled for this VM")]
    Unsupported,

    #[error("region error: {0}")]
    Region(#[from] RegionError),
}

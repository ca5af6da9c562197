use esn_core::{HcallError, RegionError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuestError {
    #[error("hypercall failed: {0}")]
    Hcall(#[from] HcallError),

    #[error("region error: {0}")]
    Region(#[from] RegionError),

    #[error("invalid guest configuration: {0}")]
    InvalidConfig(String),
}

//! Shared types for the ESN async page-fault protocol: the notification
//! region, the per-vCPU control block, tokens and the hypercall ABI.

mod error;
pub mod fault;
pub mod hcall;
pub mod memory;
pub mod region;
pub mod token;
pub mod vpa;

pub use error::{HcallError, RegionError};
pub use fault::FaultFrame;
pub use hcall::{HcallMessage, HcallReturn, Hypercall};
pub use memory::{GuestMemory, PAGE_SIZE, PinnedRange};
pub use region::SharedRegion;
pub use token::{Token, TokenCounter};
pub use vpa::VpaView;

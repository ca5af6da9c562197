//! Hypervisor side of the ESN async page-fault protocol.
//!
//! Admits expropriations, hands them to the async page-fault machinery, and
//! publishes subvention tokens into the guest's notification region.

mod error;
mod issuer;
mod platform;
mod registry;
mod telemetry;
mod vm;

pub use error::HostError;
pub use issuer::{Admission, Publication};
pub use platform::{AsyncPfScheduler, AsyncPfWork, VcpuControl};
pub use registry::{Attachment, SnsRegistry};
pub use telemetry::{DeclineReason, ProtocolViolation, Telemetry, TelemetrySnapshot};
pub use vm::{HostVm, HostVmConfig};

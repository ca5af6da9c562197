//! Collaborators the issuer relies on but does not implement.

use esn_core::{FaultFrame, Token};

/// An admitted expropriation handed to the async page-fault machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncPfWork {
    pub vcpu: u32,
    pub token: Token,
    /// Attachment the token's ring slot was reserved in.
    pub generation: u64,
    pub gpa: u64,
    pub hva: u64,
}

/// Generic async page-fault scheduling.
///
/// For every scheduled item the implementation calls
/// [`HostVm::page_not_present`](crate::HostVm::page_not_present) and later
/// exactly one [`HostVm::page_ready`](crate::HostVm::page_ready).
pub trait AsyncPfScheduler: Send + Sync {
    fn schedule(&self, work: AsyncPfWork);
}

/// Access to the running vcpus.
pub trait VcpuControl: Send + Sync {
    /// Machine state of the vcpu at the point it took the current fault.
    fn guest_msr(&self, vcpu: u32) -> u64;

    fn inject_fault(&self, vcpu: u32, frame: FaultFrame);

    /// Force an exit so that the pending virtual interrupt `irq` is delivered.
    fn request_exit(&self, vcpu: u32, irq: u32);
}

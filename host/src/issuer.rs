//! Token issuance and subvention publication.
//!
//! Admission takes `sns_lock` to check the producer slot and reserve ring
//! capacity, drops it, then takes `exp_lock` to allocate the token.
//! Publication takes `sns_lock` alone. The two locks are never held together.

use crate::platform::AsyncPfWork;
use crate::telemetry::{DeclineReason, ProtocolViolation};
use crate::vm::HostVm;
use esn_core::fault::msr_is_privileged;
use esn_core::{FaultFrame, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(Token),
    Declined(DeclineReason),
}

impl Admission {
    pub fn token(&self) -> Option<Token> {
        match *self {
            Admission::Admitted(token) => Some(token),
            Admission::Declined(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publication {
    Published { slot: usize },
    Dropped(ProtocolViolation),
}

impl HostVm {
    /// Decide whether an expropriation of `gpa` (backed by `hva`) on `vcpu`
    /// can be handled asynchronously by the guest.
    pub fn admit_expropriation(&self, vcpu: u32, gpa: u64, hva: u64) -> Admission {
        match self.try_admit(vcpu) {
            Ok((token, generation)) => {
                self.telemetry.record_admitted();
                tracing::debug!(vcpu, %token, gpa, "expropriation admitted");
                self.scheduler.schedule(AsyncPfWork {
                    vcpu,
                    token,
                    generation,
                    gpa,
                    hva,
                });
                Admission::Admitted(token)
            }
            Err(reason) => {
                self.telemetry.record_decline(vcpu, reason);
                Admission::Declined(reason)
            }
        }
    }

    /// Returns the token and the generation of the attachment it holds a
    /// reservation in.
    fn try_admit(&self, vcpu: u32) -> Result<(Token, u64), DeclineReason> {
        let cpu = self.vcpu(vcpu).ok_or(DeclineReason::VpaNotRegistered)?;
        let vpa = cpu.vpa.lock().expect("vpa lock poisoned");
        let vpa = vpa.as_ref().ok_or(DeclineReason::VpaNotRegistered)?;

        let generation = {
            let mut sns = self.sns.lock().expect("sns lock poisoned");
            let attachment = sns
                .attachment_mut()
                .ok_or(DeclineReason::SnrNotAttached)?;
            if !vpa.exp_int_enabled() {
                return Err(DeclineReason::NotEnabled);
            }
            if msr_is_privileged(self.control.guest_msr(vcpu)) {
                return Err(DeclineReason::PrivilegedFault);
            }
            if attachment.region().slot_load(attachment.next()).is_some() {
                return Err(DeclineReason::RingFull);
            }
            if !attachment.has_capacity() {
                return Err(DeclineReason::TooManyOutstanding);
            }
            attachment.reserve();
            attachment.generation()
        };

        let token = self.exp.lock().expect("exp lock poisoned").next_token();
        vpa.set_exp_corr_nr(token);
        Ok((token, generation))
    }

    /// The page is gone: deliver the expropriation fault to the guest.
    pub fn page_not_present(&self, work: &AsyncPfWork) {
        let frame = FaultFrame::expropriation(work.gpa, self.control.guest_msr(work.vcpu));
        tracing::debug!(vcpu = work.vcpu, token = %work.token, "injecting expropriation fault");
        self.telemetry.record_fault_injected();
        self.control.inject_fault(work.vcpu, frame);
    }

    /// The page is back: publish the work's token on the ring and kick the
    /// vcpu. Work admitted under an earlier attachment is dropped without
    /// touching the current ring.
    pub fn page_ready(&self, work: &AsyncPfWork) -> Publication {
        let (vcpu, token) = (work.vcpu, work.token);
        let publication = {
            let mut sns = self.sns.lock().expect("sns lock poisoned");
            match sns.attachment_mut() {
                None => Publication::Dropped(ProtocolViolation::NotAttached),
                Some(attachment) if attachment.generation() != work.generation => {
                    Publication::Dropped(ProtocolViolation::StaleAttachment)
                }
                Some(attachment) if !attachment.region().subvention_enabled() => {
                    attachment.release();
                    Publication::Dropped(ProtocolViolation::SubventionDisabled)
                }
                Some(attachment) => {
                    attachment.release();
                    match attachment.publish(token) {
                        Some(slot) => Publication::Published { slot },
                        None => Publication::Dropped(ProtocolViolation::SlotOccupied),
                    }
                }
            }
        };

        match publication {
            Publication::Published { slot } => {
                self.telemetry.record_published();
                tracing::debug!(vcpu, %token, slot, "subvention published");
                self.control.request_exit(vcpu, self.config.irq);
            }
            Publication::Dropped(violation) => {
                self.telemetry.record_violation(vcpu, violation);
            }
        }
        publication
    }
}

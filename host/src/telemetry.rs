//! Counters for admissions, declines and protocol violations.
//!
//! Declines are never reported as errors to the caller; this is where they
//! become observable.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    VpaNotRegistered,
    SnrNotAttached,
    NotEnabled,
    PrivilegedFault,
    RingFull,
    TooManyOutstanding,
}

impl DeclineReason {
    pub const ALL: [DeclineReason; 6] = [
        DeclineReason::VpaNotRegistered,
        DeclineReason::SnrNotAttached,
        DeclineReason::NotEnabled,
        DeclineReason::PrivilegedFault,
        DeclineReason::RingFull,
        DeclineReason::TooManyOutstanding,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeclineReason::VpaNotRegistered => "vpa_not_registered",
            DeclineReason::SnrNotAttached => "snr_not_attached",
            DeclineReason::NotEnabled => "not_enabled",
            DeclineReason::PrivilegedFault => "privileged_fault",
            DeclineReason::RingFull => "ring_full",
            DeclineReason::TooManyOutstanding => "too_many_outstanding",
        }
    }

    /// Declines that clear once the guest drains the ring.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            DeclineReason::RingFull | DeclineReason::TooManyOutstanding
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolViolation {
    /// Page became ready while the guest had notifications disabled.
    SubventionDisabled,
    /// The producer slot still held an unconsumed token.
    SlotOccupied,
    /// Page became ready after the region was deregistered.
    NotAttached,
    /// Page became ready for a token admitted under an earlier attachment.
    StaleAttachment,
}

#[derive(Debug, Default)]
pub struct Telemetry {
    admitted: AtomicU64,
    declined: [AtomicU64; 6],
    faults_injected: AtomicU64,
    published: AtomicU64,
    overflows: AtomicU64,
    violations: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decline(&self, vcpu: u32, reason: DeclineReason) {
        self.declined[reason.index()].fetch_add(1, Ordering::Relaxed);
        if reason.is_transient() {
            tracing::warn!(vcpu, reason = reason.as_str(), "expropriation declined");
        } else {
            tracing::debug!(vcpu, reason = reason.as_str(), "expropriation declined");
        }
    }

    pub(crate) fn record_fault_injected(&self) {
        self.faults_injected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_violation(&self, vcpu: u32, violation: ProtocolViolation) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        if violation == ProtocolViolation::SlotOccupied {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        tracing::error!(vcpu, ?violation, "subvention protocol violation");
    }

    pub fn declined(&self, reason: DeclineReason) -> u64 {
        self.declined[reason.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            declined: DeclineReason::ALL
                .iter()
                .map(|&r| (r.as_str(), self.declined(r)))
                .collect(),
            faults_injected: self.faults_injected.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub admitted: u64,
    pub declined: BTreeMap<&'static str, u64>,
    pub faults_injected: u64,
    pub published: u64,
    pub overflows: u64,
    pub violations: u64,
}

impl TelemetrySnapshot {
    pub fn total_declined(&self) -> u64 {
        self.declined.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decline_counters() {
        let t = Telemetry::new();
        t.record_decline(0, DeclineReason::RingFull);
        t.record_decline(1, DeclineReason::RingFull);
        t.record_decline(1, DeclineReason::NotEnabled);
        assert_eq!(t.declined(DeclineReason::RingFull), 2);
        let snap = t.snapshot();
        assert_eq!(snap.declined["not_enabled"], 1);
        assert_eq!(snap.declined["vpa_not_registered"], 0);
        assert_eq!(snap.total_declined(), 3);
    }

    #[test]
    fn test_transient_reasons() {
        let transient: Vec<_> = DeclineReason::ALL
            .into_iter()
            .filter(|r| r.is_transient())
            .collect();
        assert_eq!(
            transient,
            vec![DeclineReason::RingFull, DeclineReason::TooManyOutstanding]
        );
    }

    #[test]
    fn test_slot_occupied_counts_overflow() {
        let t = Telemetry::new();
        t.record_violation(0, ProtocolViolation::SlotOccupied);
        t.record_violation(0, ProtocolViolation::SubventionDisabled);
        let snap = t.snapshot();
        assert_eq!(snap.violations, 2);
        assert_eq!(snap.overflows, 1);
    }
}

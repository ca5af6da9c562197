//! Scripted replays of the protocol's reference interleavings on a two-slot
//! ring with four waiter buckets.
//!
//! Each scenario drives the host and the guest by hand, one step at a time,
//! and fails on the first observation that does not match.

use crate::error::CliError;
use clap::ValueEnum;
use esn_core::fault::MSR_PR;
use esn_core::{FaultFrame, GuestMemory, PAGE_SIZE, SharedRegion, Token};
use esn_guest::{
    EntryKind, GuestApf, GuestConfig, GuestError, ParkOutcome, SnsVeneer, ThreadCpu, WaiterTable,
    WakeOutcome,
};
use esn_host::{
    Admission, AsyncPfScheduler, AsyncPfWork, DeclineReason, HostVm, HostVmConfig, Publication,
    VcpuControl,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const SNR_GPA: u64 = 0x800;
const SNR_LEN: usize = 6;
const VPA_BASE: u64 = 0x100;
const BUCKET_BITS: u32 = 2;
const WAITER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::S1,
        Scenario::S2,
        Scenario::S3,
        Scenario::S4,
        Scenario::S5,
        Scenario::S6,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::S1 => "s1",
            Scenario::S2 => "s2",
            Scenario::S3 => "s3",
            Scenario::S4 => "s4",
            Scenario::S5 => "s5",
            Scenario::S6 => "s6",
        }
    }

    pub fn summary(self) -> &'static str {
        match self {
            Scenario::S1 => "straight-line park-then-wake",
            Scenario::S2 => "wake racing ahead of sleep",
            Scenario::S3 => "overflow",
            Scenario::S4 => "kernel-mode async page fault",
            Scenario::S5 => "deregister then re-attach",
            Scenario::S6 => "interleaved multi-vcpu",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub summary: &'static str,
    pub trace: Vec<String>,
}

pub fn run(scenario: Scenario) -> Result<ScenarioReport, CliError> {
    let mut trace = Trace {
        scenario,
        lines: Vec::new(),
    };
    match scenario {
        Scenario::S1 => straight_line(&mut trace)?,
        Scenario::S2 => wake_races_ahead(&mut trace)?,
        Scenario::S3 => overflow(&mut trace)?,
        Scenario::S4 => kernel_mode_fault(&mut trace)?,
        Scenario::S5 => reattach(&mut trace)?,
        Scenario::S6 => interleaved(&mut trace)?,
    }
    tracing::info!(scenario = scenario.name(), steps = trace.lines.len(), "scenario passed");
    Ok(ScenarioReport {
        scenario: scenario.name(),
        summary: scenario.summary(),
        trace: trace.lines,
    })
}

struct Trace {
    scenario: Scenario,
    lines: Vec<String>,
}

impl Trace {
    fn step(&mut self, line: String) {
        tracing::debug!(scenario = self.scenario.name(), "{line}");
        self.lines.push(line);
    }

    fn fail(&self, reason: impl Into<String>) -> CliError {
        CliError::ScenarioFailed {
            scenario: self.scenario.name(),
            reason: reason.into(),
        }
    }

    fn ensure(&self, ok: bool, reason: impl Into<String>) -> Result<(), CliError> {
        if ok { Ok(()) } else { Err(self.fail(reason)) }
    }
}

/// Records everything the host asks of the platform.
#[derive(Default)]
struct Recorder {
    faults: Mutex<Vec<(u32, FaultFrame)>>,
    work: Mutex<Vec<AsyncPfWork>>,
    exits: Mutex<Vec<(u32, u32)>>,
}

impl VcpuControl for Recorder {
    fn guest_msr(&self, _vcpu: u32) -> u64 {
        MSR_PR
    }

    fn inject_fault(&self, vcpu: u32, frame: FaultFrame) {
        self.faults
            .lock()
            .expect("recorder lock poisoned")
            .push((vcpu, frame));
    }

    fn request_exit(&self, vcpu: u32, irq: u32) {
        self.exits
            .lock()
            .expect("recorder lock poisoned")
            .push((vcpu, irq));
    }
}

impl AsyncPfScheduler for Recorder {
    fn schedule(&self, work: AsyncPfWork) {
        self.work.lock().expect("recorder lock poisoned").push(work);
    }
}

/// A two-vcpu VM with the guest fully initialized.
struct Bench {
    platform: Arc<Recorder>,
    host: Arc<HostVm>,
    guest: GuestApf,
    /// Guest-side view of the ring, for inspection.
    ring: SharedRegion,
    /// Work whose fault has been injected but whose page is not ready yet.
    in_flight: Mutex<Vec<AsyncPfWork>>,
}

impl Bench {
    fn boot(last_token: u16) -> Result<Self, CliError> {
        let memory = GuestMemory::with_granule(PAGE_SIZE, 2)?;
        let platform = Arc::new(Recorder::default());
        let host = Arc::new(HostVm::new(
            memory.clone(),
            HostVmConfig {
                vcpus: 2,
                last_token,
                ..Default::default()
            },
            platform.clone(),
            platform.clone(),
        ));
        let config = GuestConfig {
            vcpus: 2,
            snr_gpa: SNR_GPA,
            snr_len: SNR_LEN,
            vpa_base: VPA_BASE,
            bucket_bits: BUCKET_BITS,
        };
        let guest = GuestApf::init(&memory, host.clone(), &config)?;
        let ring = SharedRegion::map(&memory, SNR_GPA, SNR_LEN)?;
        Ok(Self {
            platform,
            host,
            guest,
            ring,
            in_flight: Mutex::new(Vec::new()),
        })
    }

    fn ring(&self) -> Vec<u16> {
        self.ring
            .ring()
            .into_iter()
            .map(|slot| slot.map_or(0, Token::get))
            .collect()
    }

    fn admit(&self, trace: &mut Trace, vcpu: u32) -> Result<Token, CliError> {
        match self.host.admit_expropriation(vcpu, 0x10_0000 + u64::from(vcpu) * 0x1000, 0) {
            Admission::Admitted(token) => {
                trace.step(format!("HI admits T={token} for vcpu {vcpu}"));
                Ok(token)
            }
            Admission::Declined(reason) => {
                Err(trace.fail(format!("vcpu {vcpu} declined: {}", reason.as_str())))
            }
        }
    }

    /// Run the scheduled async work for `token` and collect the injected fault.
    fn inject(&self, trace: &mut Trace, token: Token) -> Result<FaultFrame, CliError> {
        let work = {
            let mut work = self.platform.work.lock().expect("recorder lock poisoned");
            let idx = work.iter().position(|w| w.token == token);
            idx.map(|i| work.remove(i))
        };
        let work = work.ok_or_else(|| trace.fail(format!("no async work for T={token}")))?;
        self.host.page_not_present(&work);

        let mut faults = self.platform.faults.lock().expect("recorder lock poisoned");
        let idx = faults.iter().position(|(v, _)| *v == work.vcpu);
        let (vcpu, frame) = idx
            .map(|i| faults.remove(i))
            .ok_or_else(|| trace.fail(format!("no fault injected for T={token}")))?;
        trace.step(format!("fault injected on vcpu {vcpu} for T={token}"));
        self.in_flight
            .lock()
            .expect("bench lock poisoned")
            .push(work);
        Ok(frame)
    }

    fn publish(&self, trace: &mut Trace, token: Token) -> Result<(), CliError> {
        let work = {
            let mut in_flight = self.in_flight.lock().expect("bench lock poisoned");
            let idx = in_flight.iter().position(|w| w.token == token);
            idx.map(|i| in_flight.remove(i))
        };
        let work = work.ok_or_else(|| trace.fail(format!("T={token} was never injected")))?;
        match self.host.page_ready(&work) {
            Publication::Published { slot } => {
                trace.step(format!("HI publishes T={token} in slot {slot}: ring = {:?}", self.ring()));
                Ok(())
            }
            Publication::Dropped(violation) => {
                Err(trace.fail(format!("T={token} dropped: {violation:?}")))
            }
        }
    }
}

/// Spin until `token` has a parked waiter.
fn wait_for_waiter(table: &WaiterTable, token: Token) -> bool {
    let deadline = Instant::now() + WAITER_TIMEOUT;
    while table.entry(token) != Some(EntryKind::Waiting) {
        if Instant::now() > deadline {
            return false;
        }
        thread::yield_now();
    }
    true
}

fn straight_line(trace: &mut Trace) -> Result<(), CliError> {
    let bench = Bench::boot(0)?;
    let t1 = bench.admit(trace, 0)?;
    trace.ensure(t1.get() == 1, format!("expected T=1, got {t1}"))?;
    let vpa_token = bench.guest.vpa(0).and_then(|v| v.exp_corr_nr());
    trace.ensure(vpa_token == Some(t1), "exp_corr_nr not written")?;
    let frame = bench.inject(trace, t1)?;

    let (queued, published, drained, outcome) = thread::scope(|s| {
        let gp = s.spawn(|| bench.guest.handle_fault(&ThreadCpu::new(0), &frame));
        let queued = wait_for_waiter(bench.guest.table(), t1);
        let published = bench.publish(trace, t1);
        let drained = bench.guest.handle_irq(0);
        (queued, published, drained, gp.join())
    });
    trace.ensure(queued, "GP never registered a waiter")?;
    trace.step(format!("GP(vcpu 0) registered T={t1} and slept"));
    published?;
    trace.ensure(drained == 1, format!("GD drained {drained} tokens"))?;
    trace.step(format!("GD drains: ring = {:?}", bench.ring()));
    trace.ensure(bench.ring() == [0, 0], "ring not cleared")?;

    let outcome = outcome.map_err(|_| trace.fail("GP panicked"))?;
    trace.ensure(outcome == ParkOutcome::Parked, format!("GP returned {outcome:?}"))?;
    trace.step("GP returns Parked".into());
    Ok(())
}

fn wake_races_ahead(trace: &mut Trace) -> Result<(), CliError> {
    let bench = Bench::boot(1)?;
    let t2 = bench.admit(trace, 1)?;
    trace.ensure(t2.get() == 2, format!("expected T=2, got {t2}"))?;
    let frame = bench.inject(trace, t2)?;
    bench.publish(trace, t2)?;
    trace.ensure(bench.ring() == [2, 0], "T=2 not in slot 0")?;

    let drained = bench.guest.handle_irq(1);
    trace.ensure(drained == 1, format!("GD drained {drained} tokens"))?;
    let entry = bench.guest.table().entry(t2);
    trace.ensure(entry == Some(EntryKind::Placeholder), format!("entry is {entry:?}"))?;
    trace.step(format!("GD finds no waiter for T={t2}, leaves a placeholder"));

    let outcome = bench.guest.handle_fault(&ThreadCpu::new(1), &frame);
    trace.ensure(
        outcome == ParkOutcome::WakeRacedAhead,
        format!("GP returned {outcome:?}"),
    )?;
    trace.ensure(bench.guest.table().is_empty(), "placeholder not consumed")?;
    trace.step("GP(vcpu 1) consumes the placeholder, returns WakeRacedAhead".into());
    Ok(())
}

fn overflow(trace: &mut Trace) -> Result<(), CliError> {
    let bench = Bench::boot(8)?;
    for (slot, value) in [(0, 5), (1, 7)] {
        let token = Token::new(value).ok_or_else(|| trace.fail("zero token"))?;
        trace.ensure(bench.ring.slot_cas(slot, None, Some(token)), "prefill failed")?;
    }
    trace.step(format!("ring pre-filled: {:?}", bench.ring()));

    let admission = bench.host.admit_expropriation(0, 0x10_0000, 0);
    trace.ensure(
        admission == Admission::Declined(DeclineReason::RingFull),
        format!("expected ring_full decline, got {admission:?}"),
    )?;
    trace.step("HI declines T=9: ring full".into());
    trace.ensure(bench.ring() == [5, 7], "ring modified")?;
    trace.ensure(bench.host.last_token() == 8, "token counter advanced")?;
    let vpa_token = bench.guest.vpa(0).and_then(|v| v.exp_corr_nr());
    trace.ensure(vpa_token.is_none(), "exp_corr_nr written on decline")?;
    let scheduled = bench.platform.work.lock().expect("recorder lock poisoned").len();
    trace.ensure(scheduled == 0, "async work scheduled on decline")?;
    trace.step("ring, counter and VPA unchanged".into());
    Ok(())
}

fn kernel_mode_fault(trace: &mut Trace) -> Result<(), CliError> {
    let bench = Bench::boot(0)?;
    bench.admit(trace, 0)?;
    let frame = FaultFrame::expropriation(0x10_0000, 0);
    trace.step("fault with the async bit set delivered in supervisor mode".into());

    let result = thread::scope(|s| {
        s.spawn(|| bench.guest.handle_fault(&ThreadCpu::new(0), &frame))
            .join()
    });
    trace.ensure(result.is_err(), format!("GP returned {:?}", result.ok()))?;
    trace.step("GP panics".into());
    Ok(())
}

fn reattach(trace: &mut Trace) -> Result<(), CliError> {
    const GPA: u64 = 0x1000;
    let memory = GuestMemory::with_granule(2 * PAGE_SIZE, 2)?;
    let platform = Arc::new(Recorder::default());
    let host = Arc::new(HostVm::new(
        memory.clone(),
        HostVmConfig::default(),
        platform.clone(),
        platform,
    ));
    let veneer = SnsVeneer::new(host.clone());

    let first = veneer.register(GPA, PAGE_SIZE).map_err(GuestError::from)?;
    trace.step(format!("attach({GPA:#x}, {PAGE_SIZE}) -> irq {first:#x}"));
    let view = SharedRegion::map(&memory, GPA, PAGE_SIZE)?;
    view.set_subvention_enabled(true);
    let token = Token::new(3).ok_or_else(|| trace.fail("zero token"))?;
    trace.ensure(view.slot_cas(0, None, Some(token)), "slot write failed")?;
    view.mark_overflow();

    let detached = veneer.deregister().map_err(GuestError::from)?;
    let again = veneer.deregister().map_err(GuestError::from)?;
    trace.ensure(detached && !again, "deregister is not idempotent")?;
    trace.ensure(!host.sns_attached(), "region still attached")?;
    trace.step("detach twice: one effect".into());

    let second = veneer.register(GPA, PAGE_SIZE).map_err(GuestError::from)?;
    trace.step(format!("attach({GPA:#x}, {PAGE_SIZE}) -> irq {second:#x}"));
    trace.ensure(view.control() == 0, "control byte not cleared")?;
    trace.ensure(!view.overflowed(), "overflow bit not cleared")?;
    trace.ensure(view.ring().iter().all(Option::is_none), "ring not cleared")?;
    trace.step("region reads all zero after re-attach".into());
    Ok(())
}

fn interleaved(trace: &mut Trace) -> Result<(), CliError> {
    let bench = Bench::boot(0)?;
    let t1 = bench.admit(trace, 0)?;
    let t2 = bench.admit(trace, 1)?;
    let f1 = bench.inject(trace, t1)?;
    let f2 = bench.inject(trace, t2)?;

    let mut woken = Vec::new();
    let (queued, published, gp1, gp2) = thread::scope(|s| {
        let gp1 = s.spawn(|| bench.guest.handle_fault(&ThreadCpu::new(0), &f1));
        let gp2 = s.spawn(|| bench.guest.handle_fault(&ThreadCpu::new(1), &f2));
        let queued = wait_for_waiter(bench.guest.table(), t1)
            && wait_for_waiter(bench.guest.table(), t2);
        let published = bench
            .publish(trace, t2)
            .and_then(|()| bench.publish(trace, t1));
        bench
            .guest
            .dispatcher()
            .drain(0, |token, outcome| woken.push((token, outcome)));
        (queued, published, gp1.join(), gp2.join())
    });
    trace.ensure(queued, "GP never registered both waiters")?;
    published?;
    trace.step("both vcpus parked before the drain".into());

    let expected = [(t2, WakeOutcome::Woken), (t1, WakeOutcome::Woken)];
    trace.ensure(woken == expected, format!("wake order {woken:?}"))?;
    trace.step(format!("GD wakes T={t2} (vcpu 1) then T={t1} (vcpu 0)"));

    for (vcpu, outcome) in [(0, gp1), (1, gp2)] {
        let outcome = outcome.map_err(|_| trace.fail(format!("GP(vcpu {vcpu}) panicked")))?;
        trace.ensure(
            outcome == ParkOutcome::Parked,
            format!("GP(vcpu {vcpu}) returned {outcome:?}"),
        )?;
    }
    trace.step("both return Parked".into());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_scenario_passes() {
        for scenario in Scenario::ALL {
            let report = run(scenario).unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(report.scenario, scenario.name());
            assert!(!report.trace.is_empty());
        }
    }

    #[test]
    fn test_names_parse() {
        for scenario in Scenario::ALL {
            assert_eq!(Scenario::from_str(scenario.name(), true), Ok(scenario));
        }
        assert!(Scenario::from_str("s7", true).is_err());
    }

    #[test]
    fn test_wake_order_in_trace() {
        let report = run(Scenario::S6).unwrap();
        let wake = report
            .trace
            .iter()
            .find(|l| l.starts_with("GD wakes"))
            .unwrap();
        assert_eq!(wake, "GD wakes T=2 (vcpu 1) then T=1 (vcpu 0)");
    }

    #[test]
    fn test_failure_names_scenario() {
        let trace = Trace {
            scenario: Scenario::S3,
            lines: Vec::new(),
        };
        let err = trace.ensure(false, "ring modified").unwrap_err();
        assert_eq!(err.to_string(), "scenario s3 failed: ring modified");
    }
}

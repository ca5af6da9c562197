//! Workload simulator.
//!
//! Every vcpu is an OS thread that repeatedly takes an expropriation and
//! handles the injected fault. Tokio tasks play the hypervisor's async
//! page-fault machinery: they inject the fault, wait out the page-in latency,
//! publish the subvention and deliver the interrupt to the guest.

use crate::config::SimConfig;
use crate::error::CliError;
use esn_core::fault::MSR_PR;
use esn_core::{FaultFrame, GuestMemory, PAGE_SIZE};
use esn_guest::{GuestApf, GuestStatsSnapshot, ParkOutcome, ThreadCpu};
use esn_host::{
    Admission, AsyncPfScheduler, AsyncPfWork, HostVm, HostVmConfig, TelemetrySnapshot,
    VcpuControl,
};
use serde::Serialize;
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

const DECLINE_BACKOFF: Duration = Duration::from_micros(50);
const FAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Platform glue: fault injection goes to the vcpu thread, exits and
/// scheduled work go to the async side.
struct SimPlatform {
    faults: Vec<mpsc::Sender<FaultFrame>>,
    exits: UnboundedSender<(u32, u32)>,
    work: UnboundedSender<AsyncPfWork>,
}

impl VcpuControl for SimPlatform {
    fn guest_msr(&self, _vcpu: u32) -> u64 {
        MSR_PR
    }

    fn inject_fault(&self, vcpu: u32, frame: FaultFrame) {
        match self.faults.get(vcpu as usize) {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    tracing::debug!(vcpu, "vcpu thread gone, fault dropped");
                }
            }
            None => tracing::warn!(vcpu, "fault injected into unknown vcpu"),
        }
    }

    fn request_exit(&self, vcpu: u32, irq: u32) {
        let _ = self.exits.send((vcpu, irq));
    }
}

impl AsyncPfScheduler for SimPlatform {
    fn schedule(&self, work: AsyncPfWork) {
        let _ = self.work.send(work);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VcpuTally {
    pub parked: u64,
    pub raced_ahead: u64,
    pub not_async_pf: u64,
    /// Admissions retried after a transient decline.
    pub retries: u64,
}

impl VcpuTally {
    fn record(&mut self, outcome: ParkOutcome) {
        match outcome {
            ParkOutcome::Parked => self.parked += 1,
            ParkOutcome::WakeRacedAhead => self.raced_ahead += 1,
            ParkOutcome::NotAsyncPf => self.not_async_pf += 1,
        }
    }

    fn merge(&mut self, other: &VcpuTally) {
        self.parked += other.parked;
        self.raced_ahead += other.raced_ahead;
        self.not_async_pf += other.not_async_pf;
        self.retries += other.retries;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub config: SimConfig,
    pub outcomes: VcpuTally,
    pub last_token: u16,
    pub elapsed_ms: u64,
    pub host: TelemetrySnapshot,
    pub guest: GuestStatsSnapshot,
}

/// Run the workload described by `config` to completion.
pub async fn simulate(config: SimConfig) -> Result<SimReport, CliError> {
    config.validate()?;
    let started = Instant::now();

    let memory = GuestMemory::new(config.memory_bytes())?;
    let (exit_tx, exit_rx) = unbounded_channel();
    let (work_tx, work_rx) = unbounded_channel();
    let (fault_txs, fault_rxs): (Vec<_>, Vec<_>) = (0..config.vcpus)
        .map(|_| mpsc::channel::<FaultFrame>())
        .unzip();

    let platform = Arc::new(SimPlatform {
        faults: fault_txs,
        exits: exit_tx,
        work: work_tx,
    });
    let host = Arc::new(HostVm::new(
        memory.clone(),
        HostVmConfig {
            vcpus: config.vcpus,
            ..Default::default()
        },
        platform.clone(),
        platform,
    ));
    let guest = Arc::new(GuestApf::init(&memory, host.clone(), &config.guest_config())?);
    tracing::info!(
        vcpus = config.vcpus,
        faults_per_vcpu = config.faults_per_vcpu,
        latency_ms = config.latency_ms,
        "simulation started"
    );

    let pump = tokio::spawn(pump_work(
        host.clone(),
        work_rx,
        Duration::from_millis(config.latency_ms),
    ));
    let irqs = tokio::spawn(deliver_irqs(guest.clone(), exit_rx));

    let mut vcpus = Vec::with_capacity(config.vcpus as usize);
    for (vcpu, faults) in (0..config.vcpus).zip(fault_rxs) {
        let host = host.clone();
        let guest = guest.clone();
        let count = config.faults_per_vcpu;
        vcpus.push(tokio::task::spawn_blocking(move || {
            run_vcpu(vcpu, count, &host, &guest, &faults)
        }));
    }

    let mut outcomes = VcpuTally::default();
    let mut result = Ok(());
    for handle in vcpus {
        match handle.await? {
            Ok(tally) => outcomes.merge(&tally),
            Err(e) => result = Err(e),
        }
    }

    pump.abort();
    irqs.abort();
    guest.shutdown()?;
    result?;

    let report = SimReport {
        config,
        outcomes,
        last_token: host.last_token(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        host: host.telemetry().snapshot(),
        guest: guest.stats(),
    };
    tracing::info!(
        admitted = report.host.admitted,
        parked = report.outcomes.parked,
        raced_ahead = report.outcomes.raced_ahead,
        "simulation finished"
    );
    Ok(report)
}

/// One vcpu: take `count` expropriations back to back.
fn run_vcpu(
    vcpu: u32,
    count: u32,
    host: &HostVm,
    guest: &GuestApf,
    faults: &mpsc::Receiver<FaultFrame>,
) -> Result<VcpuTally, CliError> {
    let cpu = ThreadCpu::new(vcpu);
    let mut tally = VcpuTally::default();

    for n in 0..count {
        let gpa = (u64::from(vcpu) << 32) | (u64::from(n) * PAGE_SIZE as u64);
        loop {
            match host.admit_expropriation(vcpu, gpa, gpa) {
                Admission::Admitted(_) => break,
                Admission::Declined(reason) if reason.is_transient() => {
                    tally.retries += 1;
                    std::thread::sleep(DECLINE_BACKOFF);
                }
                Admission::Declined(reason) => {
                    return Err(CliError::Stalled(format!(
                        "vcpu {vcpu} declined: {}",
                        reason.as_str()
                    )));
                }
            }
        }

        let frame = faults
            .recv_timeout(FAULT_TIMEOUT)
            .map_err(|e| CliError::Stalled(format!("vcpu {vcpu} waiting for fault: {e}")))?;
        tally.record(guest.handle_fault(&cpu, &frame));
    }

    tracing::debug!(vcpu, yields = cpu.yields(), "vcpu done");
    Ok(tally)
}

async fn pump_work(host: Arc<HostVm>, mut work: UnboundedReceiver<AsyncPfWork>, latency: Duration) {
    while let Some(item) = work.recv().await {
        let host = host.clone();
        tokio::spawn(async move {
            host.page_not_present(&item);
            tokio::time::sleep(latency).await;
            host.page_ready(&item);
        });
    }
}

async fn deliver_irqs(guest: Arc<GuestApf>, mut exits: UnboundedReceiver<(u32, u32)>) {
    while let Some((vcpu, irq)) = exits.recv().await {
        if irq == guest.irq() {
            guest.handle_irq(vcpu);
        }
    }
}

//! Guest bring-up and the two entry points the platform calls: fault entry
//! and the subvention interrupt.

use crate::cpu::GuestCpu;
use crate::dispatcher::Dispatcher;
use crate::error::GuestError;
use crate::hcall::SnsVeneer;
use crate::parker::{ParkOutcome, Parker};
use crate::stats::{GuestStats, GuestStatsSnapshot};
use crate::waiters::WaiterTable;
use esn_core::vpa::VPA_SIZE;
use esn_core::{FaultFrame, GuestMemory, Hypercall, SharedRegion, VpaView};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestConfig {
    pub vcpus: u32,
    /// Guest physical address of the notification region.
    pub snr_gpa: u64,
    pub snr_len: usize,
    /// VPA of vcpu `n` lives at `vpa_base + n * VPA_SIZE`.
    pub vpa_base: u64,
    #[serde(default = "default_bucket_bits")]
    pub bucket_bits: u32,
}

fn default_bucket_bits() -> u32 {
    6
}

impl GuestConfig {
    pub fn vpa_gpa(&self, vcpu: u32) -> u64 {
        self.vpa_base + u64::from(vcpu) * VPA_SIZE as u64
    }
}

pub struct GuestApf {
    veneer: SnsVeneer,
    table: Arc<WaiterTable>,
    parker: Parker,
    dispatcher: Dispatcher,
    vpas: Vec<VpaView>,
    stats: Arc<GuestStats>,
    irq: u32,
}

impl GuestApf {
    /// Register the per-vcpu areas and the notification region, then
    /// advertise readiness to the host.
    pub fn init(
        memory: &Arc<GuestMemory>,
        hv: Arc<dyn Hypercall>,
        config: &GuestConfig,
    ) -> Result<Self, GuestError> {
        if config.vcpus == 0 {
            return Err(GuestError::InvalidConfig("at least one vcpu is required".into()));
        }
        let veneer = SnsVeneer::new(hv);

        let mut vpas = Vec::with_capacity(config.vcpus as usize);
        let (irq, region) = match Self::register_all(&veneer, memory, config, &mut vpas) {
            Ok(registered) => registered,
            Err(e) => {
                Self::unregister_all(&veneer, vpas.len() as u32);
                return Err(e);
            }
        };

        let table = Arc::new(WaiterTable::new(config.bucket_bits));
        let stats = Arc::new(GuestStats::default());
        let parker = Parker::new(table.clone(), stats.clone());
        let dispatcher = Dispatcher::new(table.clone(), stats.clone());

        region.set_subvention_enabled(true);
        tracing::info!(
            slots = region.slots(),
            buckets = table.buckets(),
            irq,
            "async page faults enabled"
        );
        dispatcher.attach(region);
        for vpa in &vpas {
            vpa.set_exp_int_enabled(true);
        }

        Ok(Self {
            veneer,
            table,
            parker,
            dispatcher,
            vpas,
            stats,
            irq,
        })
    }

    /// Register every VPA, then the notification region. `vpas` holds the
    /// areas registered so far when this fails.
    fn register_all(
        veneer: &SnsVeneer,
        memory: &Arc<GuestMemory>,
        config: &GuestConfig,
        vpas: &mut Vec<VpaView>,
    ) -> Result<(u32, SharedRegion), GuestError> {
        for vcpu in 0..config.vcpus {
            let gpa = config.vpa_gpa(vcpu);
            let vpa = VpaView::map(memory, gpa)?;
            veneer.register_vpa(vcpu, gpa)?;
            vpas.push(vpa);
        }
        let irq = veneer.register(config.snr_gpa, config.snr_len)?;
        let region = SharedRegion::map(memory, config.snr_gpa, config.snr_len)?;
        Ok((irq, region))
    }

    /// Undo a partial bring-up. Failures are logged; the original error wins.
    fn unregister_all(veneer: &SnsVeneer, vpas: u32) {
        if let Err(e) = veneer.deregister() {
            tracing::warn!(error = %e, "failed to deregister notification region");
        }
        for vcpu in 0..vpas {
            if let Err(e) = veneer.deregister_vpa(vcpu) {
                tracing::warn!(vcpu, error = %e, "failed to deregister vpa");
            }
        }
    }

    /// Fault entry. Blocks the calling thread if the fault is an
    /// expropriation whose subvention has not arrived yet.
    pub fn handle_fault(&self, cpu: &dyn GuestCpu, frame: &FaultFrame) -> ParkOutcome {
        match self.vpas.get(cpu.cpu_id() as usize) {
            Some(vpa) => self.parker.park_if_async_pf(cpu, vpa, frame),
            None => {
                tracing::warn!(cpu = cpu.cpu_id(), "fault on cpu without a vpa");
                ParkOutcome::NotAsyncPf
            }
        }
    }

    /// Subvention interrupt handler.
    pub fn handle_irq(&self, cpu: u32) -> usize {
        self.dispatcher.drain_subventions(cpu)
    }

    /// Stop accepting notifications and deregister. Safe to call twice.
    pub fn shutdown(&self) -> Result<(), GuestError> {
        for vpa in &self.vpas {
            vpa.set_exp_int_enabled(false);
        }
        if let Some(region) = self.dispatcher.detach() {
            region.set_subvention_enabled(false);
        }
        if self.veneer.deregister()? {
            tracing::info!("async page faults disabled");
        }
        Ok(())
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn table(&self) -> &Arc<WaiterTable> {
        &self.table
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn vpa(&self, vcpu: u32) -> Option<&VpaView> {
        self.vpas.get(vcpu as usize)
    }

    pub fn stats(&self) -> GuestStatsSnapshot {
        self.stats.snapshot(&self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::ThreadCpu;
    use esn_core::fault::MSR_PR;
    use esn_core::hcall::SNS_DEREGISTER;
    use esn_core::{FaultFrame, HcallError, HcallMessage, HcallReturn, PAGE_SIZE, VpaView};
    use esn_host::{
        Admission, AsyncPfScheduler, AsyncPfWork, HostVm, HostVmConfig, Publication, VcpuControl,
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct Platform {
        faults: Mutex<Vec<(u32, FaultFrame)>>,
        work: Mutex<Vec<AsyncPfWork>>,
    }

    impl VcpuControl for Platform {
        fn guest_msr(&self, _vcpu: u32) -> u64 {
            MSR_PR
        }

        fn inject_fault(&self, vcpu: u32, frame: FaultFrame) {
            self.faults.lock().unwrap().push((vcpu, frame));
        }

        fn request_exit(&self, _vcpu: u32, _irq: u32) {}
    }

    impl AsyncPfScheduler for Platform {
        fn schedule(&self, work: AsyncPfWork) {
            self.work.lock().unwrap().push(work);
        }
    }

    fn config() -> GuestConfig {
        GuestConfig {
            vcpus: 2,
            snr_gpa: 0x1000,
            snr_len: PAGE_SIZE,
            vpa_base: 0x100,
            bucket_bits: 2,
        }
    }

    fn boot() -> (Arc<HostVm>, Arc<Platform>, GuestApf, Arc<GuestMemory>) {
        let mem = GuestMemory::new(4 * PAGE_SIZE).unwrap();
        let platform = Arc::new(Platform::default());
        let host = Arc::new(HostVm::new(
            mem.clone(),
            HostVmConfig {
                vcpus: 2,
                ..Default::default()
            },
            platform.clone(),
            platform.clone(),
        ));
        let guest = GuestApf::init(&mem, host.clone(), &config()).unwrap();
        (host, platform, guest, mem)
    }

    #[test]
    fn test_init_advertises_readiness() {
        let (host, _platform, guest, mem) = boot();
        assert!(host.sns_attached());
        assert_eq!(guest.irq(), host.irq());
        let host_view = SharedRegion::map(&mem, 0x1000, PAGE_SIZE).unwrap();
        assert!(host_view.subvention_enabled());
        assert!(VpaView::map(&mem, config().vpa_gpa(1)).unwrap().exp_int_enabled());
    }

    #[test]
    fn test_round_trip_through_host() {
        let (host, platform, guest, _mem) = boot();
        let Admission::Admitted(token) = host.admit_expropriation(0, 0x3000, 0) else {
            panic!("admission declined");
        };
        let work = platform.work.lock().unwrap()[0];
        host.page_not_present(&work);
        let (vcpu, frame) = platform.faults.lock().unwrap()[0];
        assert_eq!(guest.vpa(vcpu).unwrap().exp_corr_nr(), Some(token));

        assert_eq!(host.page_ready(&work), Publication::Published { slot: 0 });
        assert_eq!(guest.handle_irq(0), 1);

        let cpu = ThreadCpu::new(vcpu);
        assert_eq!(guest.handle_fault(&cpu, &frame), ParkOutcome::WakeRacedAhead);
        let stats = guest.stats();
        assert_eq!(stats.placeholders, 1);
        assert_eq!(stats.raced_ahead, 1);
        assert!(guest.table().is_empty());
    }

    #[test]
    fn test_fault_on_unknown_cpu() {
        let (_host, _platform, guest, _mem) = boot();
        let cpu = ThreadCpu::new(7);
        let frame = FaultFrame::expropriation(0, MSR_PR);
        assert_eq!(guest.handle_fault(&cpu, &frame), ParkOutcome::NotAsyncPf);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (host, _platform, guest, _mem) = boot();
        guest.shutdown().unwrap();
        assert!(!host.sns_attached());
        assert!(!guest.vpa(0).unwrap().exp_int_enabled());
        guest.shutdown().unwrap();
        assert_eq!(
            host.admit_expropriation(0, 0, 0),
            Admission::Declined(esn_host::DeclineReason::SnrNotAttached)
        );
    }

    #[test]
    fn test_config_bucket_bits_default() {
        let config: GuestConfig = serde_json::from_str(
            r#"{"vcpus": 2, "snr_gpa": 4096, "snr_len": 4096, "vpa_base": 256}"#,
        )
        .unwrap();
        assert_eq!(config.bucket_bits, 6);
        assert_eq!(config.vpa_gpa(1), 256 + VPA_SIZE as u64);
    }

    /// Passes everything through to the host but reports an interrupt
    /// number that does not fit in 32 bits.
    struct WideIrq(Arc<HostVm>);

    impl Hypercall for WideIrq {
        fn hcall(&self, msg: &HcallMessage) -> HcallReturn {
            let ret = self.0.hcall(msg);
            match msg {
                HcallMessage::RegisterSns { gpa, .. }
                    if *gpa != SNS_DEREGISTER && ret.status == 0 =>
                {
                    HcallReturn::success(u64::from(u32::MAX) + 1)
                }
                _ => ret,
            }
        }
    }

    fn bare_host() -> (Arc<HostVm>, Arc<GuestMemory>) {
        let mem = GuestMemory::new(4 * PAGE_SIZE).unwrap();
        let platform = Arc::new(Platform::default());
        let host = Arc::new(HostVm::new(
            mem.clone(),
            HostVmConfig {
                vcpus: 2,
                ..Default::default()
            },
            platform.clone(),
            platform,
        ));
        (host, mem)
    }

    #[test]
    fn test_failed_region_registration_releases_vpas() {
        let (host, mem) = bare_host();
        let bad = GuestConfig {
            snr_len: 3,
            ..config()
        };
        assert!(matches!(
            GuestApf::init(&mem, host.clone(), &bad),
            Err(GuestError::Hcall(HcallError::HypervisorRejected(_)))
        ));
        assert!(!host.sns_attached());
        assert!(!host.deregister_vpa(0).unwrap());
        assert!(!host.deregister_vpa(1).unwrap());

        // A clean retry is not blocked by leftovers.
        GuestApf::init(&mem, host.clone(), &config()).unwrap();
        assert!(host.sns_attached());
    }

    #[test]
    fn test_unusable_irq_releases_everything() {
        let (host, mem) = bare_host();
        let hv = Arc::new(WideIrq(host.clone()));
        assert!(matches!(
            GuestApf::init(&mem, hv, &config()),
            Err(GuestError::Hcall(HcallError::InvalidReturn(_)))
        ));
        assert!(!host.sns_attached());
        assert!(!host.deregister_vpa(0).unwrap());
        assert!(!host.deregister_vpa(1).unwrap());
    }

    #[test]
    fn test_init_requires_vcpus() {
        let mem = GuestMemory::new(4 * PAGE_SIZE).unwrap();
        let platform = Arc::new(Platform::default());
        let host = Arc::new(HostVm::new(
            mem.clone(),
            HostVmConfig::default(),
            platform.clone(),
            platform,
        ));
        let config = GuestConfig {
            vcpus: 0,
            ..config()
        };
        assert!(matches!(
            GuestApf::init(&mem, host, &config),
            Err(GuestError::InvalidConfig(_))
        ));
    }
}

//! Host-side state of one guest VM.

use crate::error::HostError;
use crate::platform::{AsyncPfScheduler, VcpuControl};
use crate::registry::SnsRegistry;
use crate::telemetry::Telemetry;
use esn_core::hcall::{H_FUNCTION, H_P2, H_PARAMETER, H_RESOURCE, SNS_DEREGISTER};
use esn_core::{
    GuestMemory, HcallMessage, HcallReturn, Hypercall, RegionError, Token, TokenCounter, VpaView,
};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct HostVmConfig {
    pub vcpus: u32,
    /// Virtual interrupt raised for subvention notifications.
    pub irq: u32,
    /// Whether the VM exposes the ESN facility at all.
    pub esn_enabled: bool,
    /// The first token issued is `last_token + 1`.
    pub last_token: u16,
}

impl Default for HostVmConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            irq: 0x20,
            esn_enabled: true,
            last_token: 0,
        }
    }
}

pub(crate) struct HostVcpu {
    pub(crate) vpa: Mutex<Option<VpaView>>,
}

pub struct HostVm {
    pub(crate) memory: Arc<GuestMemory>,
    pub(crate) vcpus: Vec<HostVcpu>,
    /// Producer side of the notification region (`sns_lock`).
    pub(crate) sns: Mutex<SnsRegistry>,
    /// Token allocation (`exp_lock`). Never held together with `sns`.
    pub(crate) exp: Mutex<TokenCounter>,
    pub(crate) config: HostVmConfig,
    pub(crate) control: Arc<dyn VcpuControl>,
    pub(crate) scheduler: Arc<dyn AsyncPfScheduler>,
    pub(crate) telemetry: Telemetry,
}

impl HostVm {
    pub fn new(
        memory: Arc<GuestMemory>,
        config: HostVmConfig,
        control: Arc<dyn VcpuControl>,
        scheduler: Arc<dyn AsyncPfScheduler>,
    ) -> Self {
        let vcpus = (0..config.vcpus)
            .map(|_| HostVcpu {
                vpa: Mutex::new(None),
            })
            .collect();
        Self {
            sns: Mutex::new(SnsRegistry::new(memory.clone())),
            exp: Mutex::new(TokenCounter::starting_after(config.last_token)),
            memory,
            vcpus,
            config,
            control,
            scheduler,
            telemetry: Telemetry::new(),
        }
    }

    pub fn irq(&self) -> u32 {
        self.config.irq
    }

    pub fn vcpu_count(&self) -> u32 {
        self.config.vcpus
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub(crate) fn vcpu(&self, vcpu: u32) -> Option<&HostVcpu> {
        self.vcpus.get(vcpu as usize)
    }

    pub fn register_vpa(&self, vcpu: u32, gpa: u64) -> Result<(), HostError> {
        let cpu = self.vcpu(vcpu).ok_or(HostError::NoSuchVcpu(vcpu))?;
        let view = VpaView::map(&self.memory, gpa)?;
        *cpu.vpa.lock().expect("vpa lock poisoned") = Some(view);
        tracing::info!(vcpu, gpa, "vpa registered");
        Ok(())
    }

    pub fn deregister_vpa(&self, vcpu: u32) -> Result<bool, HostError> {
        let cpu = self.vcpu(vcpu).ok_or(HostError::NoSuchVcpu(vcpu))?;
        Ok(cpu.vpa.lock().expect("vpa lock poisoned").take().is_some())
    }

    /// Attach the guest's notification region; returns the interrupt number
    /// used for subvention notifications.
    pub fn attach_sns(&self, gpa: u64, len: usize) -> Result<u32, HostError> {
        if !self.config.esn_enabled {
            return Err(HostError::Unsupported);
        }
        self.sns.lock().expect("sns lock poisoned").attach(gpa, len)?;
        Ok(self.config.irq)
    }

    pub fn detach_sns(&self) -> bool {
        self.sns.lock().expect("sns lock poisoned").detach()
    }

    pub fn sns_attached(&self) -> bool {
        self.sns
            .lock()
            .expect("sns lock poisoned")
            .attachment()
            .is_some()
    }

    /// Producer view of the ring, for diagnostics.
    pub fn sns_ring(&self) -> Option<Vec<Option<Token>>> {
        self.sns
            .lock()
            .expect("sns lock poisoned")
            .attachment()
            .map(|a| a.region().ring())
    }

    pub fn producer_cursor(&self) -> Option<usize> {
        self.sns
            .lock()
            .expect("sns lock poisoned")
            .attachment()
            .map(|a| a.next())
    }

    pub fn last_token(&self) -> u16 {
        self.exp.lock().expect("exp lock poisoned").last()
    }

    /// Tokens admitted but not yet published.
    pub fn outstanding(&self) -> usize {
        self.sns
            .lock()
            .expect("sns lock poisoned")
            .attachment()
            .map_or(0, |a| a.reserved())
    }

    fn handle_register_sns(&self, gpa: u64, len: u64) -> HcallReturn {
        if !self.config.esn_enabled {
            return HcallReturn::failure(H_FUNCTION);
        }
        if gpa == SNS_DEREGISTER {
            self.detach_sns();
            return HcallReturn::success(0);
        }
        let Ok(len) = usize::try_from(len) else {
            return HcallReturn::failure(H_PARAMETER);
        };
        match self.attach_sns(gpa, len) {
            Ok(irq) => HcallReturn::success(u64::from(irq)),
            Err(HostError::Region(e)) => HcallReturn::failure(region_status(&e)),
            Err(HostError::Unsupported) => HcallReturn::failure(H_FUNCTION),
            Err(HostError::NoSuchVcpu(_)) => HcallReturn::failure(H_PARAMETER),
        }
    }

    fn handle_register_vpa(&self, vcpu: u32, gpa: u64) -> HcallReturn {
        let result = if gpa == SNS_DEREGISTER {
            self.deregister_vpa(vcpu).map(|_| ())
        } else {
            self.register_vpa(vcpu, gpa)
        };
        match result {
            Ok(()) => HcallReturn::success(0),
            Err(HostError::Region(e)) => HcallReturn::failure(region_status(&e)),
            Err(_) => HcallReturn::failure(H_PARAMETER),
        }
    }
}

fn region_status(err: &RegionError) -> i64 {
    match err {
        RegionError::InvalidLength(_)
        | RegionError::Misaligned(_)
        | RegionError::InvalidMemorySize(_) => H_PARAMETER,
        RegionError::AlreadyAttached(_) => H_RESOURCE,
        RegionError::PinFailed { .. } => H_P2,
    }
}

impl Hypercall for HostVm {
    fn hcall(&self, msg: &HcallMessage) -> HcallReturn {
        tracing::debug!(opcode = msg.opcode(), args = ?msg.args(), "hcall");
        match *msg {
            HcallMessage::RegisterSns { gpa, len } => self.handle_register_sns(gpa, len),
            HcallMessage::RegisterVpa { vcpu, gpa } => self.handle_register_vpa(vcpu, gpa),
        }
    }
}

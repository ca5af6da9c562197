//! Guest veneer over the registration hypercalls.

use esn_core::hcall::SNS_DEREGISTER;
use esn_core::{HcallError, HcallMessage, Hypercall};
use std::sync::{Arc, Mutex};

pub struct SnsVeneer {
    hv: Arc<dyn Hypercall>,
    registered: Mutex<Option<(u64, usize)>>,
}

impl SnsVeneer {
    pub fn new(hv: Arc<dyn Hypercall>) -> Self {
        Self {
            hv,
            registered: Mutex::new(None),
        }
    }

    /// Register the notification region; returns the subvention interrupt.
    pub fn register(&self, gpa: u64, len: usize) -> Result<u32, HcallError> {
        let mut registered = self.registered.lock().expect("veneer lock poisoned");
        let irq = self
            .hv
            .hcall(&HcallMessage::RegisterSns {
                gpa,
                len: len as u64,
            })
            .into_result()?;
        // Recorded before the irq check so a bad return can still be deregistered.
        *registered = Some((gpa, len));
        let irq = u32::try_from(irq).map_err(|_| HcallError::InvalidReturn(irq))?;
        tracing::info!(gpa, len, irq, "notification region registered");
        Ok(irq)
    }

    /// Deregister the region. Returns `false` without calling the hypervisor
    /// when nothing is registered.
    pub fn deregister(&self) -> Result<bool, HcallError> {
        let mut registered = self.registered.lock().expect("veneer lock poisoned");
        let Some((gpa, len)) = *registered else {
            return Ok(false);
        };
        self.hv
            .hcall(&HcallMessage::RegisterSns {
                gpa: SNS_DEREGISTER,
                len: len as u64,
            })
            .into_result()?;
        *registered = None;
        tracing::info!(gpa, "notification region deregistered");
        Ok(true)
    }

    pub fn register_vpa(&self, vcpu: u32, gpa: u64) -> Result<(), HcallError> {
        self.hv
            .hcall(&HcallMessage::RegisterVpa { vcpu, gpa })
            .into_result()?;
        Ok(())
    }

    pub fn deregister_vpa(&self, vcpu: u32) -> Result<(), HcallError> {
        self.hv
            .hcall(&HcallMessage::RegisterVpa {
                vcpu,
                gpa: SNS_DEREGISTER,
            })
            .into_result()?;
        Ok(())
    }

    pub fn registered(&self) -> Option<(u64, usize)> {
        *self.registered.lock().expect("veneer lock poisoned")
    }
}

//! Fault-entry side: park the faulting thread until its page is back.

use crate::cpu::GuestCpu;
use crate::stats::GuestStats;
use crate::waiters::WaiterTable;
use esn_core::{FaultFrame, VpaView};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParkOutcome {
    NotAsyncPf,
    Parked,
    WakeRacedAhead,
}

pub struct Parker {
    table: Arc<WaiterTable>,
    stats: Arc<GuestStats>,
}

impl Parker {
    pub fn new(table: Arc<WaiterTable>, stats: Arc<GuestStats>) -> Self {
        Self { table, stats }
    }

    /// Called on fault entry with local interrupts disabled.
    ///
    /// # Panics
    ///
    /// If the host delivered an expropriation fault while the cpu was in
    /// supervisor mode.
    pub fn park_if_async_pf(
        &self,
        cpu: &dyn GuestCpu,
        vpa: &VpaView,
        frame: &FaultFrame,
    ) -> ParkOutcome {
        if !frame.is_expropriation() {
            GuestStats::bump(&self.stats.not_async);
            return ParkOutcome::NotAsyncPf;
        }
        if frame.is_privileged() {
            panic!("host injected async PF in kernel mode");
        }
        let Some(token) = vpa.exp_corr_nr() else {
            tracing::error!(cpu = cpu.cpu_id(), "expropriation fault without a token");
            GuestStats::bump(&self.stats.not_async);
            return ParkOutcome::NotAsyncPf;
        };

        let me = std::thread::current();
        if !self.table.queue_task(token, me.clone()) {
            tracing::debug!(cpu = cpu.cpu_id(), %token, "wake raced ahead of fault");
            GuestStats::bump(&self.stats.raced_ahead);
            return ParkOutcome::WakeRacedAhead;
        }

        tracing::debug!(cpu = cpu.cpu_id(), %token, "parking");
        // The park token makes the check-then-yield atomic against the
        // dispatcher's unlink-then-unpark.
        while self.table.is_linked(token, me.id()) {
            cpu.local_irq_enable();
            cpu.schedule();
            cpu.local_irq_disable();
        }
        tracing::debug!(cpu = cpu.cpu_id(), %token, "resumed");
        GuestStats::bump(&self.stats.parked);
        ParkOutcome::Parked
    }
}

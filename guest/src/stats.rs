use crate::waiters::WaiterTable;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GuestStats {
    pub(crate) parked: AtomicU64,
    pub(crate) raced_ahead: AtomicU64,
    pub(crate) not_async: AtomicU64,
    pub(crate) drained: AtomicU64,
    pub(crate) woken: AtomicU64,
    pub(crate) placeholders: AtomicU64,
    pub(crate) duplicates: AtomicU64,
}

impl GuestStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, table: &WaiterTable) -> GuestStatsSnapshot {
        GuestStatsSnapshot {
            parked: self.parked.load(Ordering::Relaxed),
            raced_ahead: self.raced_ahead.load(Ordering::Relaxed),
            not_async: self.not_async.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            woken: self.woken.load(Ordering::Relaxed),
            placeholders: self.placeholders.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            alloc_retries: table.alloc_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuestStatsSnapshot {
    pub parked: u64,
    pub raced_ahead: u64,
    pub not_async: u64,
    pub drained: u64,
    pub woken: u64,
    pub placeholders: u64,
    pub duplicates: u64,
    pub alloc_retries: u64,
}

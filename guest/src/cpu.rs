//! The scheduler interface seen by a faulting thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The cpu a guest thread is running on.
///
/// The wait primitive is the thread's own park token: a waiter records
/// `std::thread::current()` and is woken with `Thread::unpark`.
pub trait GuestCpu: Send + Sync {
    fn cpu_id(&self) -> u32;

    fn local_irq_enable(&self);

    fn local_irq_disable(&self);

    /// Yield until the current thread is unparked. May return spuriously.
    fn schedule(&self);
}

/// A [`GuestCpu`] backed by an OS thread.
#[derive(Debug)]
pub struct ThreadCpu {
    id: u32,
    irqs_enabled: AtomicBool,
    yields: AtomicU64,
}

impl ThreadCpu {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            irqs_enabled: AtomicBool::new(false),
            yields: AtomicU64::new(0),
        }
    }

    pub fn irqs_enabled(&self) -> bool {
        self.irqs_enabled.load(Ordering::Relaxed)
    }

    pub fn yields(&self) -> u64 {
        self.yields.load(Ordering::Relaxed)
    }
}

impl GuestCpu for ThreadCpu {
    fn cpu_id(&self) -> u32 {
        self.id
    }

    fn local_irq_enable(&self) {
        self.irqs_enabled.store(true, Ordering::Relaxed);
    }

    fn local_irq_disable(&self) {
        self.irqs_enabled.store(false, Ordering::Relaxed);
    }

    fn schedule(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
        std::thread::park();
    }
}

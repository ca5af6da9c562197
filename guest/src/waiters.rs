//! Sharded table of threads waiting for a subvention.
//!
//! Each bucket pairs a lock with the records for the tokens hashing to it.
//! A token has at most one record: either the thread parked on it, or a
//! placeholder left by the dispatcher when the wake arrived first. Every
//! search-then-insert runs under the bucket lock, so the parker and the
//! dispatcher can never both miss each other.

use esn_core::Token;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::{Thread, ThreadId};

const GOLDEN_RATIO_32: u32 = 0x61c8_8647;
pub const MAX_BUCKET_BITS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// A parked thread was unlinked and unparked.
    Woken,
    /// Nobody waited yet; a placeholder now records the wake.
    Placeholder,
    /// A placeholder for this token already existed.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Waiting,
    Placeholder,
}

enum RecordKind {
    Waiter(Thread),
    Placeholder { cpu: u32 },
}

struct Record {
    token: Token,
    kind: RecordKind,
}

pub struct WaiterTable {
    buckets: Box<[Mutex<Vec<Record>>]>,
    bits: u32,
    alloc_retries: AtomicU64,
    /// Makes placeholder allocation fail while it returns `true`.
    #[cfg(test)]
    fail_alloc: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

impl WaiterTable {
    /// Create a table with `1 << bucket_bits` buckets.
    pub fn new(bucket_bits: u32) -> Self {
        let bits = bucket_bits.min(MAX_BUCKET_BITS);
        let buckets = (0..1usize << bits).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            buckets,
            bits,
            alloc_retries: AtomicU64::new(0),
            #[cfg(test)]
            fail_alloc: None,
        }
    }

    #[cfg(test)]
    fn fail_alloc_while(&mut self, fail: impl Fn() -> bool + Send + Sync + 'static) {
        self.fail_alloc = Some(Box::new(fail));
    }

    /// Room for one more record in `bucket`.
    fn reserve_record(&self, bucket: &mut Vec<Record>) -> bool {
        #[cfg(test)]
        let blocked = self.fail_alloc.as_ref().is_some_and(|fail| fail());
        #[cfg(not(test))]
        let blocked = false;
        !blocked && bucket.try_reserve(1).is_ok()
    }

    pub fn buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_index(&self, token: Token) -> usize {
        if self.bits == 0 {
            return 0;
        }
        (u32::from(token.get()).wrapping_mul(GOLDEN_RATIO_32) >> (32 - self.bits)) as usize
    }

    fn lock(&self, token: Token) -> MutexGuard<'_, Vec<Record>> {
        self.buckets[self.bucket_index(token)]
            .lock()
            .expect("waiter bucket poisoned")
    }

    /// Link `waker` as the waiter for `token`.
    ///
    /// Returns `false` if the wake already arrived; the placeholder is consumed.
    pub fn queue_task(&self, token: Token, waker: Thread) -> bool {
        let mut bucket = self.lock(token);
        if let Some(pos) = bucket.iter().position(|r| r.token == token) {
            match bucket.swap_remove(pos).kind {
                RecordKind::Placeholder { cpu } => {
                    tracing::debug!(%token, cpu, "consumed early wake");
                    return false;
                }
                RecordKind::Waiter(_) => panic!("token {token} already has a waiter"),
            }
        }
        bucket.push(Record {
            token,
            kind: RecordKind::Waiter(waker),
        });
        true
    }

    /// Whether `owner` is still linked as the waiter for `token`.
    pub fn is_linked(&self, token: Token, owner: ThreadId) -> bool {
        self.lock(token).iter().any(|r| {
            r.token == token && matches!(&r.kind, RecordKind::Waiter(t) if t.id() == owner)
        })
    }

    /// Wake the waiter for `token`, or leave a placeholder for it.
    ///
    /// Never gives up: if the placeholder cannot be allocated the bucket is
    /// released and the whole search is retried.
    pub fn wake_task(&self, token: Token, cpu: u32) -> WakeOutcome {
        loop {
            let mut bucket = self.lock(token);
            if let Some(pos) = bucket.iter().position(|r| r.token == token) {
                if let RecordKind::Placeholder { .. } = bucket[pos].kind {
                    tracing::error!(%token, "duplicate subvention for token");
                    return WakeOutcome::Duplicate;
                }
                let record = bucket.swap_remove(pos);
                drop(bucket);
                if let RecordKind::Waiter(thread) = record.kind {
                    thread.unpark();
                }
                return WakeOutcome::Woken;
            }

            if !self.reserve_record(&mut bucket) {
                drop(bucket);
                self.alloc_retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%token, "placeholder allocation failed, retrying");
                std::hint::spin_loop();
                continue;
            }
            bucket.push(Record {
                token,
                kind: RecordKind::Placeholder { cpu },
            });
            return WakeOutcome::Placeholder;
        }
    }

    /// Unlink a waiter whose thread is going away.
    pub fn cancel(&self, token: Token, owner: ThreadId) -> bool {
        let mut bucket = self.lock(token);
        let pos = bucket.iter().position(|r| {
            r.token == token && matches!(&r.kind, RecordKind::Waiter(t) if t.id() == owner)
        });
        match pos {
            Some(pos) => {
                bucket.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn entry(&self, token: Token) -> Option<EntryKind> {
        self.lock(token)
            .iter()
            .find(|r| r.token == token)
            .map(|r| match r.kind {
                RecordKind::Waiter(_) => EntryKind::Waiting,
                RecordKind::Placeholder { .. } => EntryKind::Placeholder,
            })
    }

    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().expect("waiter bucket poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn alloc_retries(&self) -> u64 {
        self.alloc_retries.load(Ordering::Relaxed)
    }
}

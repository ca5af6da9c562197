//! Subvention interrupt handler: drain the ring and wake matching waiters.

use crate::stats::GuestStats;
use crate::waiters::{WaiterTable, WakeOutcome};
use esn_core::{SharedRegion, Token};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

struct Consumer {
    region: SharedRegion,
    next: usize,
}

pub struct Dispatcher {
    /// Consumer side of the ring (`sns_consumer_lock`).
    consumer: Mutex<Option<Consumer>>,
    table: Arc<WaiterTable>,
    stats: Arc<GuestStats>,
}

impl Dispatcher {
    pub fn new(table: Arc<WaiterTable>, stats: Arc<GuestStats>) -> Self {
        Self {
            consumer: Mutex::new(None),
            table,
            stats,
        }
    }

    /// Start consuming from `region` at slot 0.
    pub fn attach(&self, region: SharedRegion) {
        *self.consumer.lock().expect("consumer lock poisoned") = Some(Consumer { region, next: 0 });
    }

    pub fn detach(&self) -> Option<SharedRegion> {
        self.consumer
            .lock()
            .expect("consumer lock poisoned")
            .take()
            .map(|c| c.region)
    }

    pub fn cursor(&self) -> Option<usize> {
        self.consumer
            .lock()
            .expect("consumer lock poisoned")
            .as_ref()
            .map(|c| c.next)
    }

    /// Whether the host reported a lost subvention.
    pub fn overflowed(&self) -> bool {
        self.consumer
            .lock()
            .expect("consumer lock poisoned")
            .as_ref()
            .is_some_and(|c| c.region.overflowed())
    }

    pub fn drain_subventions(&self, cpu: u32) -> usize {
        self.drain(cpu, |_, _| {})
    }

    /// Drain every published token in producer order, reporting each wake.
    ///
    /// # Panics
    ///
    /// If a slot changes between the load and the clearing compare-exchange;
    /// only the consumer may clear a published slot.
    pub fn drain(&self, cpu: u32, mut on_wake: impl FnMut(Token, WakeOutcome)) -> usize {
        let mut consumer = self.consumer.lock().expect("consumer lock poisoned");
        let Some(c) = consumer.as_mut() else {
            return 0;
        };

        let mut drained = 0;
        while let Some(token) = c.region.slot_load(c.next) {
            if !c.region.slot_cas(c.next, Some(token), None) {
                panic!("corrupt ring: slot {} changed under the consumer", c.next);
            }
            let outcome = self.table.wake_task(token, cpu);
            match outcome {
                WakeOutcome::Woken => GuestStats::bump(&self.stats.woken),
                WakeOutcome::Placeholder => GuestStats::bump(&self.stats.placeholders),
                WakeOutcome::Duplicate => GuestStats::bump(&self.stats.duplicates),
            }
            tracing::debug!(cpu, %token, slot = c.next, ?outcome, "subvention drained");
            on_wake(token, outcome);
            c.next = (c.next + 1) % c.region.slots();
            drained += 1;
        }

        self.stats.drained.fetch_add(drained as u64, Ordering::Relaxed);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiters::EntryKind;
    use esn_core::GuestMemory;
    use std::thread;

    fn t(v: u16) -> Token {
        Token::new(v).unwrap()
    }

    /// Dispatcher over a two-slot ring plus a producer view of the same ring.
    fn setup() -> (Dispatcher, Arc<WaiterTable>, SharedRegion) {
        let mem = GuestMemory::with_granule(64, 2).unwrap();
        let table = Arc::new(WaiterTable::new(2));
        let dispatcher = Dispatcher::new(table.clone(), Arc::new(GuestStats::default()));
        dispatcher.attach(SharedRegion::map(&mem, 0, 6).unwrap());
        let producer = SharedRegion::map(&mem, 0, 6).unwrap();
        (dispatcher, table, producer)
    }

    #[test]
    fn test_empty_ring_drains_nothing() {
        let (dispatcher, table, _producer) = setup();
        assert_eq!(dispatcher.drain_subventions(0), 0);
        assert_eq!(dispatcher.cursor(), Some(0));
        assert!(table.is_empty());
    }

    #[test]
    fn test_detached_drains_nothing() {
        let (dispatcher, _table, producer) = setup();
        assert!(producer.slot_cas(0, None, Some(t(1))));
        assert!(dispatcher.detach().is_some());
        assert_eq!(dispatcher.drain_subventions(0), 0);
        assert_eq!(producer.slot_load(0), Some(t(1)));
    }

    #[test]
    fn test_drain_clears_slots_in_order() {
        let (dispatcher, table, producer) = setup();
        assert!(producer.slot_cas(0, None, Some(t(2))));
        assert!(producer.slot_cas(1, None, Some(t(1))));

        let mut seen = Vec::new();
        let n = dispatcher.drain(4, |token, outcome| seen.push((token, outcome)));
        assert_eq!(n, 2);
        assert_eq!(
            seen,
            vec![(t(2), WakeOutcome::Placeholder), (t(1), WakeOutcome::Placeholder)]
        );
        assert_eq!(producer.ring(), vec![None, None]);
        assert_eq!(dispatcher.cursor(), Some(0));
        assert_eq!(table.entry(t(1)), Some(EntryKind::Placeholder));
    }

    #[test]
    fn test_drain_stops_at_first_empty_slot_and_wraps() {
        let (dispatcher, _table, producer) = setup();
        assert!(producer.slot_cas(0, None, Some(t(1))));
        assert_eq!(dispatcher.drain_subventions(0), 1);
        assert_eq!(dispatcher.cursor(), Some(1));

        assert!(producer.slot_cas(1, None, Some(t(2))));
        assert!(producer.slot_cas(0, None, Some(t(3))));
        let mut seen = Vec::new();
        assert_eq!(dispatcher.drain(0, |token, _| seen.push(token)), 2);
        assert_eq!(seen, vec![t(2), t(3)]);
        assert_eq!(dispatcher.cursor(), Some(1));
    }

    #[test]
    fn test_drain_wakes_parked_thread() {
        let (dispatcher, table, producer) = setup();
        let token = t(8);
        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let me = thread::current();
                assert!(table.queue_task(token, me.clone()));
                while table.is_linked(token, me.id()) {
                    thread::park();
                }
            });
            while table.entry(token).is_none() {
                thread::yield_now();
            }
            assert!(producer.slot_cas(0, None, Some(token)));
            let mut outcome = None;
            dispatcher.drain(0, |_, o| outcome = Some(o));
            assert_eq!(outcome, Some(WakeOutcome::Woken));
            waiter.join().unwrap();
        });
        assert!(table.is_empty());
    }

    #[test]
    fn test_overflow_visible_to_consumer() {
        let (dispatcher, _table, producer) = setup();
        assert!(!dispatcher.overflowed());
        producer.mark_overflow();
        assert!(dispatcher.overflowed());
    }
}

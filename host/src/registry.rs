//! Per-VM record of the attached notification region and producer cursor.

use esn_core::{GuestMemory, RegionError, SharedRegion, Token};
use std::sync::Arc;

pub struct Attachment {
    region: SharedRegion,
    generation: u64,
    next: usize,
    /// Slots promised to admitted tokens that are not yet published.
    reserved: usize,
    /// Slots written by the producer that the guest has not been seen to
    /// clear. They are the `in_ring` slots just behind the cursor.
    in_ring: usize,
}

impl Attachment {
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Distinguishes this attachment from earlier ones of the same VM.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Producer cursor.
    pub fn next(&self) -> usize {
        self.next
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Published slots the guest had not consumed at the last check.
    pub fn in_ring(&self) -> usize {
        self.in_ring
    }

    /// Whether one more token can be admitted without risking overflow.
    pub(crate) fn has_capacity(&mut self) -> bool {
        self.reclaim();
        self.reserved + self.in_ring < self.region.slots()
    }

    pub(crate) fn reserve(&mut self) {
        self.reserved += 1;
    }

    pub(crate) fn release(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Store `token` at the cursor and move past it. Returns the slot, or
    /// `None` after flagging overflow if the slot still held a token.
    pub(crate) fn publish(&mut self, token: Token) -> Option<usize> {
        let slot = self.next;
        let stored = self.region.slot_cas(slot, None, Some(token));
        if !stored {
            self.region.mark_overflow();
        }
        self.advance();
        self.in_ring = (self.in_ring + 1).min(self.region.slots());
        stored.then_some(slot)
    }

    pub(crate) fn advance(&mut self) {
        self.next = (self.next + 1) % self.region.slots();
    }

    /// The guest consumes in producer order, so retire from the oldest
    /// published slot until one is still full.
    fn reclaim(&mut self) {
        let slots = self.region.slots();
        while self.in_ring > 0 {
            let oldest = (self.next + slots - self.in_ring) % slots;
            if self.region.slot_load(oldest).is_some() {
                break;
            }
            self.in_ring -= 1;
        }
    }
}

pub struct SnsRegistry {
    memory: Arc<GuestMemory>,
    attached: Option<Attachment>,
    /// Fresh attaches so far.
    attaches: u64,
}

impl SnsRegistry {
    pub fn new(memory: Arc<GuestMemory>) -> Self {
        Self {
            memory,
            attached: None,
            attaches: 0,
        }
    }

    /// Attach the region at `gpa`. Re-attaching the current region returns
    /// it unchanged; a fresh attach starts from an all-zero region.
    pub fn attach(&mut self, gpa: u64, len: usize) -> Result<&SharedRegion, RegionError> {
        let attachment = match self.attached.take() {
            Some(a) if a.region.gpa() == gpa && a.region.len() == len => a,
            Some(a) => {
                let current = a.region.gpa();
                self.attached = Some(a);
                return Err(RegionError::AlreadyAttached(current));
            }
            None => {
                let region = SharedRegion::map(&self.memory, gpa, len)?;
                region.clear();
                self.attaches += 1;
                tracing::info!(
                    gpa,
                    len,
                    slots = region.slots(),
                    generation = self.attaches,
                    "notification region attached"
                );
                Attachment {
                    region,
                    generation: self.attaches,
                    next: 0,
                    reserved: 0,
                    in_ring: 0,
                }
            }
        };
        Ok(&self.attached.insert(attachment).region)
    }

    /// Returns `false` if nothing was attached.
    pub fn detach(&mut self) -> bool {
        match self.attached.take() {
            Some(a) => {
                tracing::info!(gpa = a.region.gpa(), "notification region detached");
                true
            }
            None => false,
        }
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attached.as_ref()
    }

    pub fn attachment_mut(&mut self) -> Option<&mut Attachment> {
        self.attached.as_mut()
    }
}

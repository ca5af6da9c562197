//! Shared notification region (SNR).
//!
//! The layout is fixed by the hypervisor ABI:
//!
//! ```text
//! byte 0      control   bit 0: guest accepts subvention notifications
//! byte 1      state     bit 0: ring overflowed (sticky)
//! byte 2..    ring      N = (len - 2) / 2 big-endian u16 token slots, 0 = empty
//! ```
//!
//! The producer (hypervisor) fills empty slots, the consumer (guest) clears
//! them back to zero with a compare-exchange.

use crate::error::RegionError;
use crate::memory::{GuestMemory, PinnedRange};
use crate::token::{Token, slot_wire};
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub const CONTROL_OFFSET: usize = 0;
pub const STATE_OFFSET: usize = 1;
pub const RING_OFFSET: usize = 2;
pub const SLOT_SIZE: usize = 2;
pub const MIN_REGION_LEN: usize = 4;

pub const CONTROL_SUBVENTION_ENABLED: u8 = 1 << 0;
pub const STATE_OVERFLOW: u8 = 1 << 0;

/// Number of ring slots a region of `len` bytes holds.
pub const fn ring_slots(len: usize) -> usize {
    len.saturating_sub(RING_OFFSET) / SLOT_SIZE
}

pub struct SharedRegion {
    range: PinnedRange,
    slots: usize,
}

impl SharedRegion {
    /// Map and pin the region at `gpa`. `len` must be at least 4 bytes and a
    /// whole number of guest pages.
    pub fn map(memory: &Arc<GuestMemory>, gpa: u64, len: usize) -> Result<Self, RegionError> {
        let granule = memory.granule();
        if len < MIN_REGION_LEN || len % granule != 0 {
            return Err(RegionError::InvalidLength(len));
        }
        if gpa % granule as u64 != 0 {
            return Err(RegionError::Misaligned(gpa));
        }
        let range = memory.pin(gpa, len)?;
        Ok(Self {
            range,
            slots: ring_slots(len),
        })
    }

    pub fn gpa(&self) -> u64 {
        self.range.gpa()
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    pub fn slot_load(&self, index: usize) -> Option<Token> {
        Token::from_wire(self.slot(index).load(Ordering::Acquire))
    }

    #[inline]
    pub fn slot_cas(&self, index: usize, expected: Option<Token>, new: Option<Token>) -> bool {
        self.slot(index)
            .compare_exchange(
                slot_wire(expected),
                slot_wire(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn subvention_enabled(&self) -> bool {
        self.range.byte(CONTROL_OFFSET).load(Ordering::Relaxed) & CONTROL_SUBVENTION_ENABLED != 0
    }

    pub fn set_subvention_enabled(&self, enabled: bool) {
        let control = self.range.byte(CONTROL_OFFSET);
        if enabled {
            control.fetch_or(CONTROL_SUBVENTION_ENABLED, Ordering::Relaxed);
        } else {
            control.fetch_and(!CONTROL_SUBVENTION_ENABLED, Ordering::Relaxed);
        }
    }

    pub fn control(&self) -> u8 {
        self.range.byte(CONTROL_OFFSET).load(Ordering::Relaxed)
    }

    pub fn overflowed(&self) -> bool {
        self.range.byte(STATE_OFFSET).load(Ordering::Acquire) & STATE_OVERFLOW != 0
    }

    pub fn mark_overflow(&self) {
        self.range
            .byte(STATE_OFFSET)
            .fetch_or(STATE_OVERFLOW, Ordering::Release);
    }

    /// Reset control, state and every ring slot to zero.
    pub fn clear(&self) {
        self.range.byte(CONTROL_OFFSET).store(0, Ordering::Relaxed);
        self.range.byte(STATE_OFFSET).store(0, Ordering::Relaxed);
        for i in 0..self.slots {
            self.slot(i).store(0, Ordering::Release);
        }
    }

    /// Current ring contents, slot by slot.
    pub fn ring(&self) -> Vec<Option<Token>> {
        (0..self.slots).map(|i| self.slot_load(i)).collect()
    }

    #[inline]
    fn slot(&self, index: usize) -> &std::sync::atomic::AtomicU16 {
        assert!(index < self.slots, "ring slot {index} out of range");
        self.range.u16_at(RING_OFFSET + index * SLOT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    fn t(v: u16) -> Option<Token> {
        Token::new(v)
    }

    fn small_region() -> SharedRegion {
        let mem = GuestMemory::with_granule(64, 2).unwrap();
        SharedRegion::map(&mem, 0, 6).unwrap()
    }

    #[test]
    fn test_geometry() {
        assert_eq!(ring_slots(4), 1);
        assert_eq!(ring_slots(6), 2);
        assert_eq!(ring_slots(PAGE_SIZE), 2047);

        let mem = GuestMemory::new(4 * PAGE_SIZE).unwrap();
        let snr = SharedRegion::map(&mem, 0x1000, PAGE_SIZE).unwrap();
        assert_eq!(snr.slots(), 2047);
        assert_eq!(snr.gpa(), 0x1000);
        assert_eq!(snr.ring().len(), 2047);
    }

    #[test]
    fn test_invalid_lengths() {
        let mem = GuestMemory::new(4 * PAGE_SIZE).unwrap();
        assert_eq!(
            SharedRegion::map(&mem, 0, 2).err(),
            Some(RegionError::InvalidLength(2))
        );
        assert_eq!(
            SharedRegion::map(&mem, 0, 100).err(),
            Some(RegionError::InvalidLength(100))
        );
        assert_eq!(
            SharedRegion::map(&mem, 0x10, PAGE_SIZE).err(),
            Some(RegionError::Misaligned(0x10))
        );
        assert!(matches!(
            SharedRegion::map(&mem, 0x3000, 2 * PAGE_SIZE),
            Err(RegionError::PinFailed { .. })
        ));
    }

    #[test]
    fn test_slot_cas() {
        let snr = small_region();
        assert_eq!(snr.slot_load(0), None);
        assert!(snr.slot_cas(0, None, t(5)));
        assert!(!snr.slot_cas(0, None, t(6)));
        assert_eq!(snr.slot_load(0), t(5));
        assert!(!snr.slot_cas(0, t(6), None));
        assert_eq!(snr.ring(), vec![t(5), None]);
        assert!(snr.slot_cas(0, t(5), None));
        assert_eq!(snr.ring(), vec![None, None]);
    }

    #[test]
    fn test_ring_bytes_are_big_endian() {
        let mem = GuestMemory::with_granule(64, 2).unwrap();
        let snr = SharedRegion::map(&mem, 0, 6).unwrap();
        let raw = mem.pin(0, 6).unwrap();
        assert!(snr.slot_cas(1, None, t(0x0102)));
        assert_eq!(raw.byte(4).load(Ordering::Relaxed), 0x01);
        assert_eq!(raw.byte(5).load(Ordering::Relaxed), 0x02);
    }

    #[test]
    fn test_control_and_overflow_bits() {
        let snr = small_region();
        assert!(!snr.subvention_enabled());
        snr.set_subvention_enabled(true);
        assert!(snr.subvention_enabled());
        assert!(!snr.overflowed());
        snr.mark_overflow();
        snr.mark_overflow();
        assert!(snr.overflowed());
        snr.set_subvention_enabled(false);
        assert!(!snr.subvention_enabled());
        assert!(snr.overflowed());
    }

    #[test]
    fn test_clear_resets_everything() {
        let snr = small_region();
        snr.set_subvention_enabled(true);
        snr.mark_overflow();
        assert!(snr.slot_cas(0, None, t(9)));
        snr.clear();
        assert_eq!(snr.control(), 0);
        assert!(!snr.overflowed());
        assert_eq!(snr.ring(), vec![None, None]);
    }
}

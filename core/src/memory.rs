//! Guest physical memory shared between the hypervisor and the guest.
//!
//! Both sides hold views onto the same bytes, so every access goes through
//! an atomic. Ranges handed out to a region are pinned and keep the backing
//! allocation alive until the last view is dropped.

use crate::error::RegionError;
use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU16};
use std::sync::{Arc, Mutex};

pub const PAGE_SIZE: usize = 4096;

pub struct GuestMemory {
    base: NonNull<u8>,
    layout: Layout,
    granule: usize,
    pins: Mutex<BTreeMap<(u64, usize), usize>>,
}

impl GuestMemory {
    /// Allocate `size` bytes of zeroed guest memory using 4 KiB pages.
    pub fn new(size: usize) -> Result<Arc<Self>, RegionError> {
        Self::with_granule(size, PAGE_SIZE)
    }

    /// Allocate guest memory whose page granule is `granule` bytes.
    ///
    /// Small granules let a region hold only a handful of ring slots.
    pub fn with_granule(size: usize, granule: usize) -> Result<Arc<Self>, RegionError> {
        if granule < 2 || granule % 2 != 0 {
            return Err(RegionError::InvalidLength(granule));
        }
        if size == 0 || size % granule != 0 {
            return Err(RegionError::InvalidMemorySize(size));
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| RegionError::InvalidMemorySize(size))?;
        // Safety: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = match NonNull::new(ptr) {
            Some(base) => base,
            None => alloc::handle_alloc_error(layout),
        };
        Ok(Arc::new(Self {
            base,
            layout,
            granule,
            pins: Mutex::new(BTreeMap::new()),
        }))
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn granule(&self) -> usize {
        self.granule
    }

    /// Pin `len` bytes at `gpa` and return a view onto them.
    pub fn pin(self: &Arc<Self>, gpa: u64, len: usize) -> Result<PinnedRange, RegionError> {
        let in_bounds = usize::try_from(gpa)
            .ok()
            .and_then(|start| start.checked_add(len).map(|end| (start, end)))
            .filter(|&(_, end)| len > 0 && end <= self.size());
        let Some((start, _)) = in_bounds else {
            tracing::debug!(gpa, len, "pin outside guest memory");
            return Err(RegionError::PinFailed { gpa, len });
        };

        *self
            .pins
            .lock()
            .expect("guest memory pin table poisoned")
            .entry((gpa, len))
            .or_insert(0) += 1;

        // Safety: `start + len` is within the allocation.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) };
        Ok(PinnedRange {
            memory: Arc::clone(self),
            gpa,
            len,
            ptr,
        })
    }

    /// Number of live pins on exactly `gpa..gpa+len`.
    pub fn pin_count(&self, gpa: u64, len: usize) -> usize {
        self.pins
            .lock()
            .expect("guest memory pin table poisoned")
            .get(&(gpa, len))
            .copied()
            .unwrap_or(0)
    }

    fn unpin(&self, gpa: u64, len: usize) {
        let mut pins = self.pins.lock().expect("guest memory pin table poisoned");
        if let Some(count) = pins.get_mut(&(gpa, len)) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&(gpa, len));
            }
        }
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        // Safety: allocated in `with_granule` with the same layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

// Safety: the allocation is only ever accessed through atomics.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

/// A pinned window of guest memory.
pub struct PinnedRange {
    memory: Arc<GuestMemory>,
    gpa: u64,
    len: usize,
    ptr: NonNull<u8>,
}

impl PinnedRange {
    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    #[inline]
    pub fn byte(&self, offset: usize) -> &AtomicU8 {
        assert!(offset < self.len, "byte offset {offset} outside pinned range");
        // Safety: in bounds, the allocation outlives `self`, and all accesses are atomic.
        unsafe { AtomicU8::from_ptr(self.ptr.as_ptr().add(offset)) }
    }

    #[inline]
    pub fn u16_at(&self, offset: usize) -> &AtomicU16 {
        assert!(offset + 2 <= self.len, "u16 offset {offset} outside pinned range");
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        assert!(ptr.cast::<u16>().is_aligned(), "u16 offset {offset} misaligned");
        // Safety: in bounds, aligned, and only accessed atomically.
        unsafe { AtomicU16::from_ptr(ptr.cast::<u16>()) }
    }
}

impl Drop for PinnedRange {
    fn drop(&mut self) {
        self.memory.unpin(self.gpa, self.len);
    }
}

// Safety: see `GuestMemory`.
unsafe impl Send for PinnedRange {}
unsafe impl Sync for PinnedRange {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_memory_starts_zeroed() {
        let mem = GuestMemory::new(2 * PAGE_SIZE).unwrap();
        let range = mem.pin(0, 2 * PAGE_SIZE).unwrap();
        assert!((0..range.len()).all(|i| range.byte(i).load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(GuestMemory::new(0).is_err());
        assert!(GuestMemory::new(PAGE_SIZE + 1).is_err());
        assert!(GuestMemory::with_granule(16, 3).is_err());
    }

    #[test]
    fn test_pin_out_of_bounds() {
        let mem = GuestMemory::new(PAGE_SIZE).unwrap();
        assert_eq!(
            mem.pin(0x800, PAGE_SIZE).err(),
            Some(RegionError::PinFailed { gpa: 0x800, len: PAGE_SIZE })
        );
        assert!(mem.pin(0, 0).is_err());
        assert!(mem.pin(u64::MAX, 1).is_err());
    }

    #[test]
    fn test_pin_count_tracks_views() {
        let mem = GuestMemory::new(PAGE_SIZE).unwrap();
        let a = mem.pin(0, 64).unwrap();
        let b = mem.pin(0, 64).unwrap();
        assert_eq!(mem.pin_count(0, 64), 2);
        drop(a);
        assert_eq!(mem.pin_count(0, 64), 1);
        drop(b);
        assert_eq!(mem.pin_count(0, 64), 0);
    }

    #[test]
    fn test_views_share_bytes() {
        let mem = GuestMemory::new(PAGE_SIZE).unwrap();
        let a = mem.pin(0x10, 4).unwrap();
        let b = mem.pin(0x10, 4).unwrap();
        a.u16_at(2).store(0xbeef, Ordering::Release);
        assert_eq!(b.u16_at(2).load(Ordering::Acquire), 0xbeef);
    }
}

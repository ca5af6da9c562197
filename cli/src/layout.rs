use esn_core::region::{
    CONTROL_OFFSET, CONTROL_SUBVENTION_ENABLED, MIN_REGION_LEN, RING_OFFSET, SLOT_SIZE,
    STATE_OFFSET, STATE_OVERFLOW, ring_slots,
};
use serde::Serialize;

use crate::error::CliError;

/// Geometry of a notification region of a given size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionLayout {
    pub bytes: usize,
    pub slots: usize,
    pub control_offset: usize,
    pub state_offset: usize,
    pub ring_offset: usize,
    pub slot_size: usize,
    pub control_subvention_enabled: u8,
    pub state_overflow: u8,
    /// Trailing bytes that do not fit a whole slot.
    pub unused: usize,
}

impl RegionLayout {
    pub fn for_size(bytes: usize) -> Result<Self, CliError> {
        if bytes < MIN_REGION_LEN {
            return Err(CliError::InvalidConfig(format!(
                "a region needs at least {MIN_REGION_LEN} bytes, got {bytes}"
            )));
        }
        let slots = ring_slots(bytes);
        Ok(Self {
            bytes,
            slots,
            control_offset: CONTROL_OFFSET,
            state_offset: STATE_OFFSET,
            ring_offset: RING_OFFSET,
            slot_size: SLOT_SIZE,
            control_subvention_enabled: CONTROL_SUBVENTION_ENABLED,
            state_overflow: STATE_OVERFLOW,
            unused: bytes - RING_OFFSET - slots * SLOT_SIZE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esn_core::PAGE_SIZE;

    #[test]
    fn test_page_layout() {
        let layout = RegionLayout::for_size(PAGE_SIZE).unwrap();
        assert_eq!(layout.slots, 2047);
        assert_eq!(layout.ring_offset, 2);
        assert_eq!(layout.unused, 0);
    }

    #[test]
    fn test_odd_size_and_minimum() {
        let layout = RegionLayout::for_size(7).unwrap();
        assert_eq!(layout.slots, 2);
        assert_eq!(layout.unused, 1);
        assert_eq!(RegionLayout::for_size(4).unwrap().slots, 1);
        assert!(RegionLayout::for_size(3).is_err());
    }
}

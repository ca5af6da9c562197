//! Per-vCPU control block (VPA).
//!
//! Only the fields used by async page faults are modelled:
//!
//! ```text
//! byte 0      flags        bit 0: guest accepts expropriation faults
//! bytes 2..4  exp_corr_nr  big-endian token of the latest expropriation
//! ```

use crate::error::RegionError;
use crate::memory::{GuestMemory, PinnedRange};
use crate::token::Token;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub const VPA_SIZE: usize = 16;
pub const VPA_FLAGS_OFFSET: usize = 0;
pub const VPA_EXP_CORR_NR_OFFSET: usize = 2;
pub const VPA_EXP_INT_ENABLED: u8 = 1 << 0;

pub struct VpaView {
    range: PinnedRange,
}

impl VpaView {
    pub fn map(memory: &Arc<GuestMemory>, gpa: u64) -> Result<Self, RegionError> {
        if gpa % 2 != 0 {
            return Err(RegionError::Misaligned(gpa));
        }
        Ok(Self {
            range: memory.pin(gpa, VPA_SIZE)?,
        })
    }

    pub fn gpa(&self) -> u64 {
        self.range.gpa()
    }

    pub fn exp_int_enabled(&self) -> bool {
        self.range.byte(VPA_FLAGS_OFFSET).load(Ordering::Acquire) & VPA_EXP_INT_ENABLED != 0
    }

    pub fn set_exp_int_enabled(&self, enabled: bool) {
        let flags = self.range.byte(VPA_FLAGS_OFFSET);
        if enabled {
            flags.fetch_or(VPA_EXP_INT_ENABLED, Ordering::Release);
        } else {
            flags.fetch_and(!VPA_EXP_INT_ENABLED, Ordering::Release);
        }
    }

    /// Token of the most recent expropriation, `None` if never written.
    pub fn exp_corr_nr(&self) -> Option<Token> {
        Token::from_wire(self.range.u16_at(VPA_EXP_CORR_NR_OFFSET).load(Ordering::Acquire))
    }

    pub fn set_exp_corr_nr(&self, token: Token) {
        self.range
            .u16_at(VPA_EXP_CORR_NR_OFFSET)
            .store(token.to_wire(), Ordering::Release);
    }
}

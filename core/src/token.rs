//! Correlation tokens shared between the issuer and the guest.
//!
//! Tokens are carried big-endian everywhere they touch shared memory. The
//! value `0` is reserved for an empty ring slot, so a `Token` is never zero.

use std::fmt;
use std::num::NonZeroU16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(NonZeroU16);

impl Token {
    pub const fn new(value: u16) -> Option<Self> {
        match NonZeroU16::new(value) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0.get()
    }

    /// Host-order value of a slot or VPA field as read from shared memory.
    #[inline]
    pub fn from_wire(raw: u16) -> Option<Self> {
        Self::new(be16_to_host(raw))
    }

    #[inline]
    pub fn to_wire(self) -> u16 {
        be16_from_host(self.get())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encode a slot value (`None` is the empty slot).
#[inline]
pub fn slot_wire(token: Option<Token>) -> u16 {
    token.map_or(0, Token::to_wire)
}

#[inline]
pub const fn be16_from_host(v: u16) -> u16 {
    v.to_be()
}

#[inline]
pub const fn be16_to_host(v: u16) -> u16 {
    u16::from_be(v)
}

/// Per-VM token allocator. Wraps around skipping zero.
#[derive(Debug, Default)]
pub struct TokenCounter {
    last: u16,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the counter so that the next token issued follows `last`.
    pub fn starting_after(last: u16) -> Self {
        Self { last }
    }

    pub fn next_token(&mut self) -> Token {
        let mut next = self.last.wrapping_add(1);
        if next == 0 {
            next = 1;
        }
        self.last = next;
        match NonZeroU16::new(next) {
            Some(v) => Token(v),
            None => unreachable!("token counter skips zero"),
        }
    }

    pub fn last(&self) -> u16 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_not_a_token() {
        assert!(Token::new(0).is_none());
        assert_eq!(Token::new(7).unwrap().get(), 7);
    }

    #[test]
    fn test_endian_round_trip() {
        for v in [1u16, 2, 0x00ff, 0x0100, 0x1234, 0x8000, u16::MAX] {
            assert_eq!(be16_to_host(be16_from_host(v)), v);
            let t = Token::new(v).unwrap();
            assert_eq!(Token::from_wire(t.to_wire()), Some(t));
        }
    }

    #[test]
    fn test_wire_bytes_are_big_endian() {
        let t = Token::new(0x1234).unwrap();
        assert_eq!(t.to_wire().to_ne_bytes(), [0x12, 0x34]);
        assert_eq!(slot_wire(None), 0);
    }

    #[test]
    fn test_counter_starts_at_one() {
        let mut c = TokenCounter::new();
        assert_eq!(c.next_token().get(), 1);
        assert_eq!(c.next_token().get(), 2);
    }

    #[test]
    fn test_counter_wrap_skips_zero() {
        let mut c = TokenCounter::starting_after(u16::MAX - 1);
        assert_eq!(c.next_token().get(), u16::MAX);
        assert_eq!(c.next_token().get(), 1);
        assert_eq!(c.last(), 1);
    }
}

use std::fmt::{Debug, Display, Formatter};

/// A 16 bit RTP sequence number.
///
/// Sequence numbers wrap around, so there is no total order. Comparisons are done relative to
///  each other: the difference is computed modulo 2^16 and interpreted as a signed value, i.e.
///  its high bit decides whether a number is 'before' or 'after' another.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SeqNum(u16);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Debug for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> SeqNum {
        SeqNum(self.0.wrapping_sub(1))
    }

    pub fn plus(&self, offset: u16) -> SeqNum {
        SeqNum(self.0.wrapping_add(offset))
    }

    pub fn minus(&self, offset: u16) -> SeqNum {
        SeqNum(self.0.wrapping_sub(offset))
    }

    /// The unsigned distance from `base` to `self`, modulo 2^16
    pub fn offset_from(&self, base: SeqNum) -> u16 {
        self.0.wrapping_sub(base.0)
    }

    /// The signed distance from `base` to `self`: negative if `self` is before `base`
    pub fn signed_offset_from(&self, base: SeqNum) -> i16 {
        self.offset_from(base) as i16
    }

    pub fn is_before(&self, other: SeqNum) -> bool {
        self.signed_offset_from(other) < 0
    }

    pub fn is_after(&self, other: SeqNum) -> bool {
        self.signed_offset_from(other) > 0
    }

    /// iterate over the inclusive range `self..=end`, following wraparound
    pub fn to_inclusive(&self, end: SeqNum) -> impl Iterator<Item = SeqNum> {
        let start = *self;
        let len = end.offset_from(start) as u32 + 1;
        (0..len).map(move |i| start.plus(i as u16))
    }
}

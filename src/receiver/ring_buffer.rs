use crate::safe_converter::SafeCast;
use crate::seq_num::SeqNum;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// An inclusive range of sequence numbers that were not received
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Gap {
    pub start: SeqNum,
    pub end: SeqNum,
}

impl Gap {
    pub fn new(start: SeqNum, end: SeqNum) -> Gap {
        Gap { start, end }
    }

    pub fn contains(&self, seq: SeqNum) -> bool {
        !seq.is_before(self.start) && !seq.is_after(self.end)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GapStatus {
    NoGap,
    /// packets are missing in the middle of the stream, blocking the read cursor
    NormalGap(Gap),
    /// the receiver joined mid-stream and is waiting for packets sent before the first one it saw
    FastStartGap(Gap),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PushOutcome {
    Stored,
    /// a retransmission of a packet that is already buffered
    Duplicate,
    /// the packet is behind the read cursor, i.e. it was delivered or skipped already
    Stale,
}

/// Pushing a packet would require the write cursor to lap the read cursor. The session can not
///  recover from this, the entire receive pipeline must be reset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RingOverflow {
    pub seq: SeqNum,
    pub read_seq: SeqNum,
}

impl Display for RingOverflow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ring buffer overflow: packet {} does not fit with read cursor at {}", self.seq, self.read_seq)
    }
}
impl std::error::Error for RingOverflow {}

/// A sequence number indexed ring of received packets that delivers them in order.
///
/// The slots between read cursor (inclusive) and write cursor (exclusive) correspond to
///  consecutive sequence numbers starting at `read_seq`; empty slots in that range are gaps.
///  All slots outside that range are always empty. Since read cursor == write cursor means
///  'empty', at most `capacity - 1` slots can be in use.
///
/// After a reset, the buffer is 'waiting for fast start': it holds back delivery until the
///  packets sent before the first received packet were either retransmitted or given up on
///  (through [RingBuffer::process_nak]).
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    mask: usize,

    read_idx: usize,
    write_idx: usize,
    read_seq: SeqNum,
    read_seq_known: bool,

    waiting_for_fast_start: bool,
    discontinuity_pending: bool,

    last_activity: Option<Instant>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> RingBuffer<T> {
        assert!(capacity.is_power_of_two() && capacity >= 4, "ring buffer capacity must be a power of two");

        RingBuffer {
            slots: (0..capacity).map(|_| None).collect(),
            mask: capacity - 1,
            read_idx: 0,
            write_idx: 0,
            read_seq: SeqNum::ZERO,
            read_seq_known: false,
            waiting_for_fast_start: true,
            discontinuity_pending: true,
            last_activity: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// discard all buffered packets and start over, waiting for fast start
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.read_idx = 0;
        self.write_idx = 0;
        self.read_seq = SeqNum::ZERO;
        self.read_seq_known = false;
        self.waiting_for_fast_start = true;
        self.discontinuity_pending = true;
        self.last_activity = None;
    }

    pub fn is_waiting_for_fast_start(&self) -> bool {
        self.waiting_for_fast_start
    }

    /// number of slots from the read cursor to the write cursor, including gaps
    fn span(&self) -> usize {
        self.write_idx.wrapping_sub(self.read_idx) & self.mask
    }

    fn slot_idx(&self, offset: usize) -> usize {
        (self.read_idx + offset) & self.mask
    }

    pub fn push(&mut self, item: T, seq: SeqNum, now: Instant) -> Result<PushOutcome, RingOverflow> {
        if !self.read_seq_known {
            trace!("first packet {:?} after reset", seq);
            self.slots[self.write_idx] = Some(item);
            self.write_idx = (self.write_idx + 1) & self.mask;
            self.read_seq = seq;
            self.read_seq_known = true;
            self.last_activity = Some(now);
            return Ok(PushOutcome::Stored);
        }

        let span = self.span();
        let offset = seq.signed_offset_from(self.read_seq);

        if offset < 0 {
            return Ok(self.push_behind_read_cursor(item, seq, offset.unsigned_abs().safe_cast(), now));
        }

        let offset = offset as usize;
        if offset < span {
            // this fills a gap, unless it is a duplicate
            let idx = self.slot_idx(offset);
            if self.slots[idx].is_some() {
                trace!("duplicate packet {:?} - dropping", seq);
                return Ok(PushOutcome::Duplicate);
            }
            trace!("packet {:?} fills a gap", seq);
            self.slots[idx] = Some(item);
            self.last_activity = Some(now);
            return Ok(PushOutcome::Stored);
        }

        // either the next expected packet or a packet further ahead that leaves a gap behind it
        if offset >= self.capacity() - 1 {
            debug!("packet {:?} is {} slots ahead of the read cursor at {:?}, which exceeds the ring buffer's capacity", seq, offset, self.read_seq);
            return Err(RingOverflow { seq, read_seq: self.read_seq });
        }
        if offset > span {
            trace!("packet {:?} arrived ahead of {} missing packets", seq, offset - span);
        }

        let idx = self.slot_idx(offset);
        self.slots[idx] = Some(item);
        self.write_idx = (idx + 1) & self.mask;
        self.last_activity = Some(now);
        Ok(PushOutcome::Stored)
    }

    fn push_behind_read_cursor(&mut self, item: T, seq: SeqNum, distance: usize, now: Instant) -> PushOutcome {
        if !self.waiting_for_fast_start {
            trace!("packet {:?} is behind the read cursor at {:?} - dropping", seq, self.read_seq);
            return PushOutcome::Stale;
        }

        if self.span() + distance >= self.capacity() - 1 {
            debug!("fast start packet {:?} does not fit into the ring buffer - dropping", seq);
            return PushOutcome::Stale;
        }

        trace!("fast start packet {:?}: moving the read cursor back by {}", seq, distance);
        self.read_idx = self.read_idx.wrapping_sub(distance) & self.mask;
        self.read_seq = seq;
        self.slots[self.read_idx] = Some(item);
        self.last_activity = Some(now);
        PushOutcome::Stored
    }

    /// Take the next packet in sequence if it is available. The flag is set on the first packet
    ///  after a reset and after a gap was skipped.
    pub fn fetch(&mut self) -> Option<(T, bool)> {
        if self.waiting_for_fast_start || !self.read_seq_known || self.read_idx == self.write_idx {
            return None;
        }

        let item = self.slots[self.read_idx].take()?;
        self.read_idx = (self.read_idx + 1) & self.mask;
        self.read_seq = self.read_seq.next();

        let discontinuity = std::mem::take(&mut self.discontinuity_pending);
        Some((item, discontinuity))
    }

    pub fn fetch_current_gap(&self) -> GapStatus {
        if !self.read_seq_known {
            return GapStatus::NoGap;
        }

        if self.waiting_for_fast_start {
            let room = (self.capacity() - 2).saturating_sub(self.span()).max(1);
            return GapStatus::FastStartGap(Gap::new(
                self.read_seq.minus(room as u16),
                self.read_seq.prev(),
            ));
        }

        let span = self.span();
        if span == 0 || self.slots[self.read_idx].is_some() {
            return GapStatus::NoGap;
        }

        let mut gap_len = 1;
        while gap_len < span && self.slots[self.slot_idx(gap_len)].is_none() {
            gap_len += 1;
        }
        GapStatus::NormalGap(Gap::new(self.read_seq, self.read_seq.plus(gap_len as u16 - 1)))
    }

    /// Give up on (part of) the current gap: `None` skips the entire gap, `Some` skips the part
    ///  of the gap covered by the range if that includes the gap's start. A fast start gap
    ///  is ended by any NAK.
    ///
    /// The next fetched packet is flagged as a discontinuity.
    pub fn process_nak(&mut self, range: Option<Gap>) {
        if !self.read_seq_known {
            return;
        }

        if self.waiting_for_fast_start {
            debug!("ending fast start at {:?}", self.read_seq);
            self.waiting_for_fast_start = false;
            self.discontinuity_pending = true;
            return;
        }

        let gap = match self.fetch_current_gap() {
            GapStatus::NormalGap(gap) => gap,
            _ => return,
        };

        let skip_end = match range {
            None => gap.end,
            Some(range) => {
                if !range.contains(gap.start) {
                    trace!("NAK {:?} does not cover the start of gap {:?} - ignoring", range, gap);
                    return;
                }
                if range.end.is_before(gap.end) { range.end } else { gap.end }
            }
        };

        let distance: usize = skip_end.offset_from(self.read_seq).safe_cast();
        let num_skipped = distance + 1;
        debug!("skipping {} missing packets starting at {:?}", num_skipped, self.read_seq);
        for _ in 0..num_skipped {
            self.slots[self.read_idx] = None;
            self.read_idx = (self.read_idx + 1) & self.mask;
        }
        self.read_seq = self.read_seq.plus(num_skipped as u16);
        self.discontinuity_pending = true;
    }

    /// `None` if no packet was received since the last reset
    pub fn time_until_inactivity_timeout(&self, now: Instant, timeout: Duration) -> Option<Duration> {
        self.last_activity
            .map(|last| (last + timeout).saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seq(raw: u16) -> SeqNum {
        SeqNum::from_raw(raw)
    }

    /// a ring buffer that already ended fast start and has delivered everything up to `first`
    fn started_ring(capacity: usize, first: u16) -> RingBuffer<u16> {
        let mut ring = RingBuffer::new(capacity);
        let now = Instant::now();
        ring.push(first, seq(first), now).unwrap();
        ring.process_nak(None);
        assert_eq!(ring.fetch(), Some((first, true)));
        ring
    }

    fn drain(ring: &mut RingBuffer<u16>) -> Vec<(u16, bool)> {
        let mut result = Vec::new();
        while let Some(x) = ring.fetch() {
            result.push(x);
        }
        result
    }

    #[test]
    fn test_scenario_gap_filled_by_retransmission() {
        let now = Instant::now();
        let mut ring = started_ring(16, 0);

        for s in [1, 2, 3, 5] {
            assert_eq!(ring.push(s, seq(s), now), Ok(PushOutcome::Stored));
        }
        assert_eq!(drain(&mut ring), vec![(1, false), (2, false), (3, false)]);
        assert_eq!(ring.fetch_current_gap(), GapStatus::NormalGap(Gap::new(seq(4), seq(4))));

        assert_eq!(ring.push(4, seq(4), now), Ok(PushOutcome::Stored));
        assert_eq!(ring.fetch_current_gap(), GapStatus::NoGap);
        assert_eq!(drain(&mut ring), vec![(4, false), (5, false)]);
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3, 4, 5, 6, 7, 8])]
    #[case::reversed_pairs(vec![2, 1, 4, 3, 6, 5, 8, 7])]
    #[case::reversed(vec![8, 7, 6, 5, 4, 3, 2, 1])]
    #[case::with_duplicates(vec![3, 1, 3, 2, 1, 5, 4, 4, 8, 6, 7, 8])]
    #[case::scattered(vec![5, 2, 8, 1, 7, 3, 6, 4])]
    fn test_fetch_in_order_without_gaps(#[case] push_order: Vec<u16>) {
        let now = Instant::now();
        let mut ring = started_ring(16, 0);

        let mut fetched = Vec::new();
        for s in push_order {
            ring.push(s, seq(s), now).unwrap();
            while let Some((x, discontinuity)) = ring.fetch() {
                assert!(!discontinuity);
                fetched.push(x);
            }
        }
        assert_eq!(fetched, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_unresolved_gap_blocks_fetch() {
        let now = Instant::now();
        let mut ring = started_ring(16, 10);

        ring.push(12, seq(12), now).unwrap();
        ring.push(13, seq(13), now).unwrap();
        assert_eq!(ring.fetch(), None);
        assert_eq!(ring.fetch_current_gap(), GapStatus::NormalGap(Gap::new(seq(11), seq(11))));
        assert_eq!(ring.fetch(), None);
    }

    #[test]
    fn test_gap_end_scans_to_next_received_packet() {
        let now = Instant::now();
        let mut ring = started_ring(16, 0);

        ring.push(5, seq(5), now).unwrap();
        ring.push(9, seq(9), now).unwrap();
        assert_eq!(ring.fetch_current_gap(), GapStatus::NormalGap(Gap::new(seq(1), seq(4))));

        // filling the tail of the gap moves its end
        ring.push(4, seq(4), now).unwrap();
        assert_eq!(ring.fetch_current_gap(), GapStatus::NormalGap(Gap::new(seq(1), seq(3))));
    }

    #[test]
    fn test_duplicate_and_stale() {
        let now = Instant::now();
        let mut ring = started_ring(16, 0);

        ring.push(1, seq(1), now).unwrap();
        ring.push(3, seq(3), now).unwrap();
        assert_eq!(ring.push(3, seq(3), now), Ok(PushOutcome::Duplicate));
        assert_eq!(drain(&mut ring), vec![(1, false)]);
        assert_eq!(ring.push(1, seq(1), now), Ok(PushOutcome::Stale));
        assert_eq!(ring.push(0, seq(0), now), Ok(PushOutcome::Stale));
        assert_eq!(ring.push(60000, seq(60000), now), Ok(PushOutcome::Stale));
    }

    #[rstest]
    #[case::ahead_at_limit(15, true)]
    #[case::ahead_below_limit(14, false)]
    #[case::far_ahead(1000, true)]
    fn test_overflow(#[case] offset: u16, #[case] expect_overflow: bool) {
        let now = Instant::now();
        let mut ring = started_ring(16, 100);
        ring.push(102, seq(102), now).unwrap();

        // read cursor is at 101
        let result = ring.push(999, seq(101 + offset), now);
        assert_eq!(result.is_err(), expect_overflow);

        if expect_overflow {
            assert_eq!(ring.fetch_current_gap(), GapStatus::NormalGap(Gap::new(seq(101), seq(101))));
            ring.push(101, seq(101), now).unwrap();
            assert_eq!(drain(&mut ring), vec![(101, false), (102, false)]);
        }
    }

    #[test]
    fn test_overflow_on_contiguous_append() {
        let now = Instant::now();
        let mut ring = started_ring(8, 0);
        for s in 1..=7 {
            assert_eq!(ring.push(s, seq(s), now), Ok(PushOutcome::Stored));
        }
        assert!(ring.push(8, seq(8), now).is_err());
        assert_eq!(drain(&mut ring), (1..=7).map(|s| (s, false)).collect::<Vec<_>>());
    }

    #[test]
    fn test_fast_start() {
        let now = Instant::now();
        let mut ring = RingBuffer::new(16);

        assert_eq!(ring.fetch_current_gap(), GapStatus::NoGap);
        ring.push(100, seq(100), now).unwrap();

        match ring.fetch_current_gap() {
            GapStatus::FastStartGap(gap) => assert_eq!(gap.end, seq(99)),
            other => panic!("expected fast start gap, was {:?}", other),
        }
        assert_eq!(ring.fetch(), None);

        ring.process_nak(None);
        assert_eq!(ring.fetch(), Some((100, true)));
        assert_eq!(ring.fetch_current_gap(), GapStatus::NoGap);
    }

    #[test]
    fn test_fast_start_rewinds_read_cursor() {
        let now = Instant::now();
        let mut ring = RingBuffer::new(16);

        ring.push(100, seq(100), now).unwrap();
        ring.push(101, seq(101), now).unwrap();
        assert_eq!(ring.push(98, seq(98), now), Ok(PushOutcome::Stored));
        assert_eq!(ring.push(97, seq(97), now), Ok(PushOutcome::Stored));
        assert_eq!(ring.push(99, seq(99), now), Ok(PushOutcome::Stored));

        match ring.fetch_current_gap() {
            GapStatus::FastStartGap(gap) => assert_eq!(gap.end, seq(96)),
            other => panic!("expected fast start gap, was {:?}", other),
        }

        // too far back to fit
        assert_eq!(ring.push(80, seq(80), now), Ok(PushOutcome::Stale));

        ring.process_nak(None);
        assert_eq!(drain(&mut ring), vec![(97, true), (98, false), (99, false), (100, false), (101, false)]);
    }

    #[test]
    fn test_fast_start_across_wraparound() {
        let now = Instant::now();
        let mut ring = RingBuffer::new(16);

        ring.push(1, seq(1), now).unwrap();
        ring.push(0, seq(0), now).unwrap();
        ring.push(65535, seq(65535), now).unwrap();
        ring.process_nak(None);
        assert_eq!(drain(&mut ring), vec![(65535, true), (0, false), (1, false)]);
    }

    #[test]
    fn test_partial_nak() {
        let now = Instant::now();
        let mut ring = started_ring(16, 0);
        ring.push(6, seq(6), now).unwrap();

        // does not cover the start of the gap [1,5]
        ring.process_nak(Some(Gap::new(seq(3), seq(4))));
        assert_eq!(ring.fetch_current_gap(), GapStatus::NormalGap(Gap::new(seq(1), seq(5))));

        ring.process_nak(Some(Gap::new(seq(1), seq(2))));
        assert_eq!(ring.fetch_current_gap(), GapStatus::NormalGap(Gap::new(seq(3), seq(5))));

        ring.push(4, seq(4), now).unwrap();
        ring.process_nak(Some(Gap::new(seq(0), seq(3))));
        assert_eq!(drain(&mut ring), vec![(4, true)]);
        assert_eq!(ring.fetch_current_gap(), GapStatus::NormalGap(Gap::new(seq(5), seq(5))));

        ring.process_nak(None);
        assert_eq!(drain(&mut ring), vec![(6, true)]);
    }

    #[test]
    fn test_discontinuity_reported_once() {
        let now = Instant::now();
        let mut ring = started_ring(16, 0);
        ring.push(3, seq(3), now).unwrap();
        ring.push(4, seq(4), now).unwrap();
        ring.process_nak(None);
        assert_eq!(drain(&mut ring), vec![(3, true), (4, false)]);
    }

    #[test]
    fn test_reset() {
        let now = Instant::now();
        let mut ring = started_ring(16, 7);
        ring.push(9, seq(9), now).unwrap();
        ring.reset();

        assert_eq!(ring.fetch_current_gap(), GapStatus::NoGap);
        assert!(ring.is_waiting_for_fast_start());
        assert_eq!(ring.time_until_inactivity_timeout(now, Duration::from_secs(1)), None);

        ring.push(500, seq(500), now).unwrap();
        ring.process_nak(None);
        assert_eq!(drain(&mut ring), vec![(500, true)]);
    }

    #[test]
    fn test_inactivity() {
        let now = Instant::now();
        let mut ring = RingBuffer::new(16);
        assert_eq!(ring.time_until_inactivity_timeout(now, Duration::from_secs(10)), None);

        ring.push(1, seq(1), now).unwrap();
        assert_eq!(ring.time_until_inactivity_timeout(now + Duration::from_secs(3), Duration::from_secs(10)), Some(Duration::from_secs(7)));
        assert_eq!(ring.time_until_inactivity_timeout(now + Duration::from_secs(11), Duration::from_secs(10)), Some(Duration::ZERO));
    }
}

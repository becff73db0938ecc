use crate::seq_num::SeqNum;
use bytes::Bytes;
use std::cmp::{max, min};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

struct RetryEntry {
    seq: SeqNum,
    datagram: Bytes,
    sent_at: Instant,
}

/// The answer to a retry request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPlan {
    /// inclusive ranges that can not be retransmitted
    pub naks: Vec<(SeqNum, SeqNum)>,
    /// datagrams to retransmit, in sequence order
    pub resend: Vec<Bytes>,
}

/// Recently sent datagrams with consecutive sequence numbers, kept for retransmission. Entries
///  are dropped when the buffer is full or when they are older than the configured TTL.
pub struct RetryBuffer {
    capacity: usize,
    ttl: Duration,
    entries: VecDeque<RetryEntry>,
}

impl RetryBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> RetryBuffer {
        assert!(capacity > 0 && capacity < 0x8000, "retry buffer capacity must fit into the signed sequence number range");
        RetryBuffer {
            capacity,
            ttl,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest_seq(&self) -> Option<SeqNum> {
        self.entries.front().map(|e| e.seq)
    }

    pub fn newest_seq(&self) -> Option<SeqNum> {
        self.entries.back().map(|e| e.seq)
    }

    pub fn push(&mut self, seq: SeqNum, datagram: Bytes, now: Instant) {
        if let Some(newest) = self.newest_seq() {
            if seq != newest.next() {
                debug!("non-consecutive sequence number {:?} after {:?} - clearing the retry buffer", seq, newest);
                self.entries.clear();
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(RetryEntry { seq, datagram, sent_at: now });
    }

    /// drop entries that are older than the TTL
    pub fn trim(&mut self, now: Instant) {
        let before = self.entries.len();
        while let Some(oldest) = self.entries.front() {
            if oldest.sent_at + self.ttl > now {
                break;
            }
            self.entries.pop_front();
        }
        if self.entries.len() != before {
            trace!("trimmed {} entries from the retry buffer", before - self.entries.len());
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Determine the response to a retry request for the inclusive range `[start, end]`: the
    ///  buffered part of the range is retransmitted, everything outside the buffer is NAK'ed.
    ///
    /// Fast start requests reach back as far as the receiver can buffer, which is typically
    ///  further than the retry buffer. Their start is silently clamped to the oldest buffered
    ///  datagram, so only a fast start request that does not overlap the buffer at all is NAK'ed.
    pub fn plan_retry(&self, start: SeqNum, end: SeqNum, is_fast_start: bool) -> RetryPlan {
        let (Some(oldest), Some(newest)) = (self.oldest_seq(), self.newest_seq()) else {
            return RetryPlan {
                naks: vec![(start, end)],
                resend: vec![],
            };
        };

        let last_idx = self.entries.len() as i32 - 1;
        let rel_start = start.signed_offset_from(oldest) as i32;
        let rel_end = end.signed_offset_from(oldest) as i32;

        if rel_end < 0 || rel_start > last_idx || rel_end < rel_start {
            return RetryPlan {
                naks: vec![(start, end)],
                resend: vec![],
            };
        }

        let mut naks = Vec::new();
        if rel_start < 0 && !is_fast_start {
            naks.push((start, oldest.prev()));
        }
        if rel_end > last_idx {
            naks.push((newest.next(), end));
        }

        let first = max(rel_start, 0) as usize;
        let last = min(rel_end, last_idx) as usize;
        let resend = self.entries.range(first..=last)
            .map(|e| e.datagram.clone())
            .collect();

        RetryPlan { naks, resend }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seq(raw: u16) -> SeqNum {
        SeqNum::from_raw(raw)
    }

    fn datagram(raw: u16) -> Bytes {
        Bytes::copy_from_slice(&raw.to_be_bytes())
    }

    fn buffer_with(first: u16, last: u16) -> RetryBuffer {
        let now = Instant::now();
        let mut buffer = RetryBuffer::new(1024, Duration::from_secs(2));
        for s in seq(first).to_inclusive(seq(last)) {
            buffer.push(s, datagram(s.to_raw()), now);
        }
        buffer
    }

    fn expected(naks: Vec<(u16, u16)>, resend: impl Iterator<Item = u16>) -> RetryPlan {
        RetryPlan {
            naks: naks.into_iter().map(|(a, b)| (seq(a), seq(b))).collect(),
            resend: resend.map(datagram).collect(),
        }
    }

    #[rstest]
    #[case::clip_both_ends(50, 150, 40, 160, false, expected(vec![(40, 49), (151, 160)], 50..=150))]
    #[case::inside(50, 150, 60, 70, false, expected(vec![], 60..=70))]
    #[case::single(50, 150, 99, 99, false, expected(vec![], 99..=99))]
    #[case::clip_start(50, 150, 10, 55, false, expected(vec![(10, 49)], 50..=55))]
    #[case::clip_end(50, 150, 150, 152, false, expected(vec![(151, 152)], 150..=150))]
    #[case::before(50, 150, 10, 20, false, expected(vec![(10, 20)], 0..0))]
    #[case::after(50, 150, 151, 160, false, expected(vec![(151, 160)], 0..0))]
    #[case::wrapped(65530, 5, 65534, 2, false, expected(vec![], [65534, 65535, 0, 1, 2].into_iter()))]
    #[case::wrapped_clip(65530, 5, 65520, 65532, false, expected(vec![(65520, 65529)], 65530..=65532))]
    #[case::fast_start_clamped(50, 150, 0, 149, true, expected(vec![], 50..=149))]
    #[case::fast_start_before(50, 150, 0, 20, true, expected(vec![(0, 20)], 0..0))]
    fn test_plan_retry(#[case] first: u16, #[case] last: u16, #[case] start: u16, #[case] end: u16, #[case] is_fast_start: bool, #[case] expected: RetryPlan) {
        let buffer = buffer_with(first, last);
        assert_eq!(buffer.plan_retry(seq(start), seq(end), is_fast_start), expected);
    }

    #[test]
    fn test_plan_retry_empty() {
        let buffer = RetryBuffer::new(16, Duration::from_secs(2));
        assert_eq!(buffer.plan_retry(seq(3), seq(7), false), expected(vec![(3, 7)], 0..0));
        assert_eq!(buffer.plan_retry(seq(3), seq(7), true), expected(vec![(3, 7)], 0..0));
    }

    #[test]
    fn test_capacity() {
        let now = Instant::now();
        let mut buffer = RetryBuffer::new(4, Duration::from_secs(2));
        for s in 1..=6 {
            buffer.push(seq(s), datagram(s), now);
        }
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.oldest_seq(), Some(seq(3)));
        assert_eq!(buffer.newest_seq(), Some(seq(6)));
    }

    #[test]
    fn test_trim() {
        let now = Instant::now();
        let mut buffer = RetryBuffer::new(16, Duration::from_secs(2));
        for s in 1..=5 {
            buffer.push(seq(s), datagram(s), now + Duration::from_millis(100 * s as u64));
        }

        buffer.trim(now + Duration::from_millis(2250));
        assert_eq!(buffer.oldest_seq(), Some(seq(3)));

        buffer.trim(now + Duration::from_secs(10));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_non_consecutive_push_clears() {
        let now = Instant::now();
        let mut buffer = RetryBuffer::new(16, Duration::from_secs(2));
        buffer.push(seq(1), datagram(1), now);
        buffer.push(seq(2), datagram(2), now);
        buffer.push(seq(9), datagram(9), now);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.oldest_seq(), Some(seq(9)));
    }
}

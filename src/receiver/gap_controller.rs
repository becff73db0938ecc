use crate::config::ReceiverConfig;
use crate::receiver::ring_buffer::{Gap, GapStatus, RingBuffer};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// A request the receiver should send to the transmitter
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GapAction {
    RequestRetry(Gap),
    RequestFastStart(Gap),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum GapState {
    Idle,
    Normal {
        gap: Gap,
        retry_deadline: Instant,
    },
    FastStart {
        gap: Gap,
        settle_deadline: Instant,
        abandon_deadline: Instant,
    },
}

/// Tracks the ring buffer's current gap over time, deciding when to request retransmission and
///  when to give up on missing packets.
///
/// A normal gap is requested when it is first seen and then every `gap_retry_timeout` for as
///  long as it persists - unless a decoder is about to run dry when the timer expires, in
///  which case the gap is skipped.
///
/// A fast start gap is requested once. It is considered complete when its end did not move
///  for `fast_start_settle_timeout`, or when `fast_start_timeout` passed since the request.
pub struct GapController {
    gap_retry_timeout: Duration,
    fast_start_settle_timeout: Duration,
    fast_start_timeout: Duration,
    state: GapState,
}

impl GapController {
    pub fn new(config: &ReceiverConfig) -> GapController {
        GapController {
            gap_retry_timeout: config.gap_retry_timeout,
            fast_start_settle_timeout: config.fast_start_settle_timeout,
            fast_start_timeout: config.fast_start_timeout,
            state: GapState::Idle,
        }
    }

    pub fn reset(&mut self) {
        self.state = GapState::Idle;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            GapState::Idle => None,
            GapState::Normal { retry_deadline, .. } => Some(retry_deadline),
            GapState::FastStart { settle_deadline, abandon_deadline, .. } => Some(settle_deadline.min(abandon_deadline)),
        }
    }

    /// Re-evaluate the ring buffer's gap. This may skip missing packets in the ring buffer, so
    ///  callers should fetch from the ring buffer afterwards and call this again until nothing
    ///  more can be fetched: a gap further back is only visible once the read position reaches it.
    pub fn process<T>(&mut self, ring: &mut RingBuffer<T>, now: Instant, mut is_about_to_underflow: impl FnMut() -> bool) -> Option<GapAction> {
        loop {
            match ring.fetch_current_gap() {
                GapStatus::NoGap => {
                    self.state = GapState::Idle;
                    return None;
                }
                GapStatus::FastStartGap(gap) => {
                    match &mut self.state {
                        GapState::FastStart { gap: prev_gap, settle_deadline, abandon_deadline } => {
                            if gap.end != prev_gap.end {
                                trace!("fast start gap moved to {:?}", gap);
                                *prev_gap = gap;
                                *settle_deadline = now + self.fast_start_settle_timeout;
                            }
                            if now < *settle_deadline && now < *abandon_deadline {
                                return None;
                            }
                            debug!("fast start is complete, continuing at {:?}", gap.end.next());
                            ring.process_nak(None);
                            self.state = GapState::Idle;
                        }
                        _ => {
                            debug!("requesting fast start for {:?}", gap);
                            self.state = GapState::FastStart {
                                gap,
                                settle_deadline: now + self.fast_start_settle_timeout,
                                abandon_deadline: now + self.fast_start_timeout,
                            };
                            return Some(GapAction::RequestFastStart(gap));
                        }
                    }
                }
                GapStatus::NormalGap(gap) => {
                    match &mut self.state {
                        GapState::Normal { gap: prev_gap, retry_deadline } if *prev_gap == gap => {
                            if now < *retry_deadline {
                                return None;
                            }
                            if is_about_to_underflow() {
                                debug!("giving up on gap {:?} to avoid decoder underflow", gap);
                                ring.process_nak(None);
                                self.state = GapState::Idle;
                            }
                            else {
                                trace!("re-requesting gap {:?}", gap);
                                *retry_deadline = now + self.gap_retry_timeout;
                                return Some(GapAction::RequestRetry(gap));
                            }
                        }
                        _ => {
                            trace!("requesting gap {:?}", gap);
                            self.state = GapState::Normal {
                                gap,
                                retry_deadline: now + self.gap_retry_timeout,
                            };
                            return Some(GapAction::RequestRetry(gap));
                        }
                    }
                }
            }
        }
    }

    /// The transmitter reported that it can not retransmit the range
    pub fn on_nak<T>(&mut self, ring: &mut RingBuffer<T>, nak: Gap) {
        match ring.fetch_current_gap() {
            GapStatus::NoGap => {
                trace!("NAK {:?} without a current gap - ignoring", nak);
            }
            GapStatus::FastStartGap(_) => {
                debug!("fast start NAK'ed by the transmitter: {:?}", nak);
                ring.process_nak(Some(nak));
                self.state = GapState::Idle;
            }
            GapStatus::NormalGap(gap) => {
                if nak.contains(gap.start) {
                    debug!("transmitter NAK'ed {:?} for gap {:?}", nak, gap);
                    ring.process_nak(Some(nak));
                    self.state = GapState::Idle;
                }
                else {
                    trace!("NAK {:?} does not affect gap {:?} - ignoring", nak, gap);
                }
            }
        }
    }
}

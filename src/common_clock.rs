use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Returned by [CommonClock::now] when the shared clock service cannot be reached or has not
///  synchronized yet. Callers distinguish this from other failures to retry later rather than
///  give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockUnavailable;

impl Display for ClockUnavailable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "common clock service unavailable")
    }
}
impl std::error::Error for ClockUnavailable {}

/// A time base shared by the transmitter and all receivers, in microseconds
#[cfg_attr(test, mockall::automock)]
pub trait CommonClock: Send + Sync + 'static {
    fn now(&self) -> Result<i64, ClockUnavailable>;
}

/// Fallback for setups without a shared clock service: microseconds on the local monotonic
///  clock since this instance was created. This is only 'common' for peers in the same process.
pub struct SystemCommonClock {
    base: Instant,
}

impl SystemCommonClock {
    pub fn new() -> SystemCommonClock {
        SystemCommonClock { base: Instant::now() }
    }
}

impl Default for SystemCommonClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CommonClock for SystemCommonClock {
    fn now(&self) -> Result<i64, ClockUnavailable> {
        i64::try_from(self.base.elapsed().as_micros())
            .map_err(|_| ClockUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemCommonClock::new();
        let a = clock.now().unwrap();
        let b = clock.now().unwrap();
        assert!(a >= 0);
        assert!(b >= a);
    }

    #[test]
    fn test_unavailable_is_distinguishable() {
        let err: anyhow::Error = ClockUnavailable.into();
        assert!(err.downcast_ref::<ClockUnavailable>().is_some());
    }
}

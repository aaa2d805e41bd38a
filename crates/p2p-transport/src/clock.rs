//! Monotonic time source used for pacing and latency accounting.

use std::sync::Arc;

/// Nanoseconds since an arbitrary, fixed origin. Never goes backwards.
pub trait MonotonicClock {
    fn now_nanoseconds(&self) -> u64;
}

impl<C: MonotonicClock + ?Sized> MonotonicClock for &C {
    fn now_nanoseconds(&self) -> u64 {
        (**self).now_nanoseconds()
    }
}

/// [`quanta`]-backed clock measured from its construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    clock: quanta::Clock,
    origin: quanta::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::from_quanta(quanta::Clock::new())
    }

    /// A clock that only moves when the returned handle is advanced.
    pub fn mock() -> (Self, Arc<quanta::Mock>) {
        let (clock, mock) = quanta::Clock::mock();
        (Self::from_quanta(clock), mock)
    }

    fn from_quanta(clock: quanta::Clock) -> Self {
        let origin = clock.now();
        SystemClock { clock, origin }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_nanoseconds(&self) -> u64 {
        self.clock.now().duration_since(self.origin).as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn mock_clock_advances_on_demand() {
        let (clock, mock) = SystemClock::mock();
        assert_eq!(clock.now_nanoseconds(), 0);
        mock.increment(Duration::from_micros(5));
        assert_eq!(clock.now_nanoseconds(), 5_000);
        mock.increment(250u64);
        assert_eq!((&clock).now_nanoseconds(), 5_250);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_nanoseconds();
        let b = clock.now_nanoseconds();
        assert!(b >= a);
    }
}

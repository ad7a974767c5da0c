//! Poisson arrival-rate estimator.
//!
//! Each variable keeps a sliding window of transaction arrival instants.
//! Modelling arrivals as a Poisson process, the probability of at least
//! one arrival within an interval t is `1 - e^(-rate * t)`; the manager
//! uses that to decide whether an idle variable is worth keeping in
//! memory.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: usize = 32;

#[derive(Debug, Default)]
pub struct Poisson {
    arrivals: VecDeque<Instant>,
}

impl Poisson {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, now: Instant) {
        if self.arrivals.len() == WINDOW {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(now);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arrivals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arrivals.is_empty()
    }

    /// Estimated arrivals per second over the window.
    #[must_use]
    pub fn rate(&self, now: Instant) -> f64 {
        let Some(first) = self.arrivals.front() else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(*first).as_secs_f64();
        // A freshly-touched window has no usable baseline; clamp so a
        // burst in the same millisecond does not read as an infinite rate.
        #[allow(clippy::cast_precision_loss)]
        let events = self.arrivals.len() as f64;
        events / elapsed.max(0.001)
    }

    /// Probability of at least one arrival within `interval` of `now`.
    #[must_use]
    pub fn p_arrival_before(&self, interval: Duration, now: Instant) -> f64 {
        1.0 - (-self.rate(now) * interval.as_secs_f64()).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_predicts_no_arrivals() {
        let p = Poisson::new();
        let now = Instant::now();
        assert_eq!(p.rate(now), 0.0);
        assert_eq!(p.p_arrival_before(Duration::from_secs(1), now), 0.0);
    }

    #[test]
    fn steady_arrivals_estimate_their_rate() {
        let mut p = Poisson::new();
        let start = Instant::now();
        // Ten arrivals, one per 100ms.
        for i in 0..10 {
            p.add(start + Duration::from_millis(100 * i));
        }
        let now = start + Duration::from_millis(900);
        let rate = p.rate(now);
        assert!((rate - 10.0 / 0.9).abs() < 0.5, "rate was {rate}");
        // At ~11/s an arrival within a second is near-certain.
        assert!(p.p_arrival_before(Duration::from_secs(1), now) > 0.99);
    }

    #[test]
    fn stale_window_decays_toward_zero() {
        let mut p = Poisson::new();
        let start = Instant::now();
        p.add(start);
        p.add(start + Duration::from_millis(10));
        let much_later = start + Duration::from_secs(3600);
        assert!(p.p_arrival_before(Duration::from_millis(500), much_later) < 0.01);
    }

    #[test]
    fn window_is_bounded() {
        let mut p = Poisson::new();
        let start = Instant::now();
        for i in 0..(WINDOW as u64 * 2) {
            p.add(start + Duration::from_millis(i));
        }
        assert_eq!(p.len(), WINDOW);
    }
}

//! Retry schedules for `Effect::repeat`.

use std::time::Duration;

use weft_types::Rng;

/// How long to wait between attempts, and how many re-runs are allowed.
///
/// Delays grow as `base * factor^(attempt - 1)`, are capped by
/// [`Schedule::max_delay`] and optionally jittered. Without [`Schedule::recurs`]
/// a schedule is unbounded.
///
/// ```
/// use std::time::Duration;
/// use weft_effects::Schedule;
///
/// let schedule = Schedule::exponential(Duration::from_millis(100), 2.0)
///     .recurs(3)
///     .max_delay(Duration::from_millis(250));
/// assert_eq!(schedule.max_recurrences(), Some(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    base: Duration,
    factor: f64,
    max_recurrences: Option<u32>,
    max_delay: Option<Duration>,
    jitter: f64,
}

impl Schedule {
    /// Same delay before every re-run.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            factor: 1.0,
            max_recurrences: None,
            max_delay: None,
            jitter: 0.0,
        }
    }

    /// Delay multiplied by `factor` after every failed attempt.
    #[must_use]
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self {
            factor: if factor.is_finite() && factor >= 1.0 {
                factor
            } else {
                1.0
            },
            ..Self::fixed(base)
        }
    }

    /// Re-run without waiting.
    #[must_use]
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// At most `n` re-runs after the first attempt.
    #[must_use]
    pub fn recurs(mut self, n: u32) -> Self {
        self.max_recurrences = Some(n);
        self
    }

    #[must_use]
    pub fn max_delay(mut self, cap: Duration) -> Self {
        self.max_delay = Some(cap);
        self
    }

    /// Spread each delay by up to `fraction` (clamped to `[0, 1]`).
    #[must_use]
    pub fn jittered(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn max_recurrences(&self) -> Option<u32> {
        self.max_recurrences
    }

    /// Whether another re-run is allowed after `attempt` failed attempts.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_recurrences.map_or(true, |max| attempt <= max)
    }

    /// Delay before re-run number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, rng: &mut dyn Rng) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let nanos = self.base.as_nanos() as f64 * self.factor.powi(exponent);
        let mut delay = if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos.round() as u64)
        } else {
            Duration::MAX
        };
        if let Some(cap) = self.max_delay {
            delay = delay.min(cap);
        }
        if self.jitter > 0.0 && !delay.is_zero() {
            delay = rng.jitter(delay, self.jitter);
        }
        delay
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), 2.0).recurs(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::SeededRng;

    #[test]
    fn test_fixed_delay() {
        let schedule = Schedule::fixed(Duration::from_millis(50));
        let mut rng = SeededRng::new(1);
        assert_eq!(schedule.delay_for(1, &mut rng), Duration::from_millis(50));
        assert_eq!(schedule.delay_for(4, &mut rng), Duration::from_millis(50));
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let schedule = Schedule::exponential(Duration::from_millis(100), 2.0)
            .max_delay(Duration::from_millis(300));
        let mut rng = SeededRng::new(1);
        let delays: Vec<_> = (1..=4).map(|n| schedule.delay_for(n, &mut rng)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn test_recurs_bound() {
        let schedule = Schedule::immediate().recurs(2);
        assert!(schedule.allows(1));
        assert!(schedule.allows(2));
        assert!(!schedule.allows(3));
        assert!(Schedule::immediate().allows(u32::MAX));
    }

    #[test]
    fn test_invalid_factor_falls_back_to_fixed() {
        let schedule = Schedule::exponential(Duration::from_millis(10), f64::NAN);
        let mut rng = SeededRng::new(1);
        assert_eq!(schedule.delay_for(5, &mut rng), Duration::from_millis(10));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let schedule = Schedule::exponential(Duration::from_secs(1), 10.0);
        let mut rng = SeededRng::new(1);
        assert_eq!(schedule.delay_for(10_000, &mut rng), Duration::MAX);
    }
}

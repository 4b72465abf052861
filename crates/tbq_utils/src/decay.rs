use std::time::Duration;

/// Yields exponentially-growing backoff durations, capped at a maximum.
/// Used by workers polling a queue that is temporarily unreachable.
#[derive(Clone, Copy, Debug)]
pub struct ExpDecay {
    starting: Duration,
    duration: Duration,
    multiplier: u32,
    max: Duration,
}

impl ExpDecay {
    pub const fn constant(duration: Duration) -> Self {
        Self {
            starting: duration,
            duration,
            multiplier: 1,
            max: duration,
        }
    }

    /// Creates a backoff that doubles on every step.
    pub const fn quadratic(starting: Duration, max: Duration) -> Self {
        Self {
            starting,
            duration: starting,
            multiplier: 2,
            max,
        }
    }

    pub fn next_duration(&mut self) -> Duration {
        let duration = self.duration;
        self.duration = std::cmp::min(self.max, self.duration * self.multiplier);
        duration
    }

    /// Starts the decay over, e.g. after the guarded operation succeeds.
    pub fn reset(&mut self) {
        self.duration = self.starting;
    }
}

impl Iterator for ExpDecay {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_duration())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::ExpDecay;

    #[test]
    fn constant() {
        let all_one_second = ExpDecay::constant(Duration::from_secs(1))
            .take(50)
            .all(|d| d == Duration::from_secs(1));
        assert!(all_one_second);
    }

    #[test]
    fn quadratic_caps_at_max() {
        let secs: Vec<_> = ExpDecay::quadratic(Duration::from_secs(1), Duration::from_secs(40))
            .take(8)
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 40, 40]);
    }

    #[test]
    fn reset_starts_over() {
        let mut decay = ExpDecay::quadratic(Duration::from_millis(10), Duration::from_secs(1));
        decay.next_duration();
        decay.next_duration();
        assert_eq!(decay.next_duration(), Duration::from_millis(40));

        decay.reset();
        assert_eq!(decay.next_duration(), Duration::from_millis(10));
    }
}

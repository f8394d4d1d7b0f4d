use rand::Rng;
use std::time::Duration;

/// Exponential delay between replays of a failing pending operation.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60), true)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// No delay at all; failed entries are due again on the next drain.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, false)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        let delay_ms = if self.jitter && exp > 0 {
            // Keep at least half the delay so retries never bunch at zero.
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }

    /// Epoch-millisecond instant at which attempt number `attempt` may run.
    pub fn retry_at(&self, attempt: u32, now_ms: i64) -> i64 {
        let delay = self.delay(attempt).as_millis().min(i64::MAX as u128) as i64;
        now_ms.saturating_add(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn delay_doubles_until_the_cap() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3), false);
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn jitter_stays_within_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(400), Duration::from_secs(60), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(2, &mut rng);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1600));
        }
    }

    #[test]
    fn immediate_backoff_is_due_now() {
        assert_eq!(Backoff::immediate().retry_at(9, 1_000), 1_000);
    }
}

/// Exponential backoff with jitter for retrying transport operations
use rand::Rng;
use std::time::Duration;

/// Jitter spread as a fraction of the computed delay
const JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempts: 0,
        }
    }

    /// Delay before the next retry; doubles each call up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempts.min(16);
        self.attempts += 1;

        let base = self.initial.saturating_mul(1u32 << exp).min(self.max);
        let spread = base.as_secs_f64() * JITTER;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0)).min(self.max)
    }

    /// Retries handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

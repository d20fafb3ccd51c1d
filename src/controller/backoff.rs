//! Exponential backoff with optional jitter for failed reconciles

use std::time::Duration;

use rand::Rng;

/// Backoff curve applied to consecutive failures of one key
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Extra random delay as a fraction of the computed delay (0.0 disables;
    /// non-finite values are ignored)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31));
        let delay = self.base.saturating_mul(factor).min(self.max);

        if !self.jitter.is_finite() || self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        delay.mul_f64(1.0 + extra).min(self.max)
    }
}

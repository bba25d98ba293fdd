use rand::Rng;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 2_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const MAX_BACKOFF_MILLIS: u64 = 10 * 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.25;

/// Exponential backoff applied to rejected queue entries.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_millis: u64,
    pub backoff_factor: f64,
    pub max_delay_millis: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_millis: DEFAULT_INITIAL_DELAY_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_millis: MAX_BACKOFF_MILLIS,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based), with +/-25% jitter.
    pub fn delay_millis(&self, attempt: u32) -> u64 {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub(crate) fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = (self.initial_delay_millis as f64) * self.backoff_factor.powi(exponent);
        let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
        (base + jitter)
            .round()
            .clamp(0.0, self.max_delay_millis as f64) as u64
    }
}

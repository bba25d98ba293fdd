use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, RunnerResult};
use crate::util::BackoffConfig;

/// Hard cap on pending operations before the oldest are evicted.
pub const DEFAULT_MAX_QUEUE_LEN: usize = 500;
/// Rejections tolerated before an operation is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_len: usize,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_QUEUE_LEN,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffConfig::default(),
        }
    }
}

impl QueueSettings {
    pub fn validate(&self) -> RunnerResult<()> {
        if self.max_len == 0 {
            return Err(invalid_input("queue.max_len must be greater than zero"));
        }
        if self.backoff.initial_delay_millis == 0 {
            return Err(invalid_input(
                "queue.backoff.initial_delay_millis must be greater than zero",
            ));
        }
        if self.backoff.backoff_factor < 1.0 {
            return Err(invalid_input("queue.backoff.backoff_factor must be at least 1"));
        }
        Ok(())
    }
}

use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, RunnerResult};

pub const DEFAULT_SCORE_CEILING: i64 = 10_000_000;
pub const DEFAULT_MIN_SUBMIT_INTERVAL_MILLIS: u64 = 5_000;
pub const DEFAULT_RANKING_INTERVAL_MILLIS: u64 = 60_000;
pub const DEFAULT_SNAPSHOT_SIZE: usize = 100;
pub const DEFAULT_JOIN_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardSettings {
    /// Inclusive upper bound for an accepted score.
    pub score_ceiling: i64,
    pub min_submit_interval_millis: u64,
    pub ranking_interval_millis: u64,
    /// Top-N rows pulled per partition.
    pub snapshot_size: usize,
    /// Optimistic attempts for a tournament join before giving up on contention.
    pub join_max_attempts: u32,
}

impl Default for LeaderboardSettings {
    fn default() -> Self {
        Self {
            score_ceiling: DEFAULT_SCORE_CEILING,
            min_submit_interval_millis: DEFAULT_MIN_SUBMIT_INTERVAL_MILLIS,
            ranking_interval_millis: DEFAULT_RANKING_INTERVAL_MILLIS,
            snapshot_size: DEFAULT_SNAPSHOT_SIZE,
            join_max_attempts: DEFAULT_JOIN_MAX_ATTEMPTS,
        }
    }
}

impl LeaderboardSettings {
    pub fn validate(&self) -> RunnerResult<()> {
        if self.score_ceiling < 0 {
            return Err(invalid_input("leaderboard.score_ceiling cannot be negative"));
        }
        if self.ranking_interval_millis == 0 {
            return Err(invalid_input("leaderboard.ranking_interval_millis must be positive"));
        }
        if self.snapshot_size == 0 {
            return Err(invalid_input("leaderboard.snapshot_size must be positive"));
        }
        if self.join_max_attempts == 0 {
            return Err(invalid_input("leaderboard.join_max_attempts must be positive"));
        }
        Ok(())
    }
}

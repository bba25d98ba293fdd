use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, RunnerResult};
use crate::model::{CurrencyBalances, CurrencyType};

pub const DEFAULT_REMOTE_TIMEOUT_MILLIS: u64 = 30_000;
pub const DEFAULT_DRAIN_BATCH_SIZE: usize = 20;
pub const DEFAULT_DRAIN_INTERVAL_MILLIS: u64 = 15_000;
pub const DEFAULT_REFRESH_INTERVAL_MILLIS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_PROFILE_MAX_AGE_MILLIS: u64 = 5 * 60 * 1_000;
/// Free-tier daily document reads.
pub const DEFAULT_DAILY_READ_BUDGET: u64 = 50_000;
/// Free-tier daily document writes.
pub const DEFAULT_DAILY_WRITE_BUDGET: u64 = 20_000;

pub fn default_starting_balances() -> CurrencyBalances {
    CurrencyBalances::new()
        .with(CurrencyType::Coins, 1_000)
        .with(CurrencyType::Gems, 50)
        .with(CurrencyType::Energy, 100)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub remote_timeout_millis: u64,
    pub drain_batch_size: usize,
    pub drain_interval_millis: u64,
    pub refresh_interval_millis: u64,
    /// Cached copies younger than this are reported as fresh.
    pub profile_max_age_millis: u64,
    /// When false, a first run without network fails instead of creating a provisional profile.
    pub allow_offline_first_run: bool,
    pub daily_read_budget: u64,
    pub daily_write_budget: u64,
    pub starting_balances: CurrencyBalances,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_timeout_millis: DEFAULT_REMOTE_TIMEOUT_MILLIS,
            drain_batch_size: DEFAULT_DRAIN_BATCH_SIZE,
            drain_interval_millis: DEFAULT_DRAIN_INTERVAL_MILLIS,
            refresh_interval_millis: DEFAULT_REFRESH_INTERVAL_MILLIS,
            profile_max_age_millis: DEFAULT_PROFILE_MAX_AGE_MILLIS,
            allow_offline_first_run: true,
            daily_read_budget: DEFAULT_DAILY_READ_BUDGET,
            daily_write_budget: DEFAULT_DAILY_WRITE_BUDGET,
            starting_balances: default_starting_balances(),
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> RunnerResult<()> {
        let positive = [
            ("sync.remote_timeout_millis", self.remote_timeout_millis),
            ("sync.drain_batch_size", self.drain_batch_size as u64),
            ("sync.drain_interval_millis", self.drain_interval_millis),
            ("sync.refresh_interval_millis", self.refresh_interval_millis),
            ("sync.daily_read_budget", self.daily_read_budget),
            ("sync.daily_write_budget", self.daily_write_budget),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(invalid_input(format!("{name} must be greater than zero")));
        }
        self.starting_balances.validate()
    }
}

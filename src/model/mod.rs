//! Player-owned documents shared by the sync, leaderboard and ledger services.

mod bot;
mod currency;
mod profile;

pub use bot::{BotRecord, BotStats, MAX_BOT_LEVEL, MAX_STAT, MIN_BOT_LEVEL, MIN_STAT};
pub use currency::{CurrencyBalances, CurrencyType};
pub use profile::{MonetizationSummary, PlayerProfile, PlayerSettings, PlayerStats, SpendSegment};

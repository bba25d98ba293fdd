//! Leaderboard & Ranking Engine.
//!
//! Accepted scores are fanned out to every applicable partition (global, time buckets, bot,
//! tournaments) as append-only entries. A friends circle has no rows of its own and is read from
//! the global board filtered to its members. Ranks are assigned locally over top-N partition
//! snapshots, refreshed by listeners and by a periodic ranking pass.

mod engine;
mod entry;
mod partition;
mod ranking;
mod settings;
mod tournament;

pub use engine::LeaderboardEngine;
pub use entry::{LeaderboardEntry, LeaderboardEvent, ScoreSubmission, SubmissionReceipt};
pub use partition::{
    daily_id, monthly_id, seasonal_id, weekly_id, LeaderboardType, PartitionKey, ALL_TIME,
};
pub use ranking::{
    compare_entries, player_ranks, rank_changes, rank_entries, window_around, RankChange,
};
pub use settings::{
    LeaderboardSettings, DEFAULT_JOIN_MAX_ATTEMPTS, DEFAULT_MIN_SUBMIT_INTERVAL_MILLIS,
    DEFAULT_RANKING_INTERVAL_MILLIS, DEFAULT_SCORE_CEILING, DEFAULT_SNAPSHOT_SIZE,
};
pub use tournament::{JoinOutcome, RewardTier, Tournament, TournamentRules};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::leaderboard::partition::LeaderboardType;
use crate::sync::WriteOutcome;

/// One accepted score in one partition. Entries are append-only; `rank` is assigned locally over
/// the latest snapshot and never stored remotely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub entry_id: String,
    pub player_id: String,
    #[serde(default)]
    pub display_name: String,
    pub score: i64,
    /// Epoch milliseconds on the wire, so remote ordering is numeric.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub achieved_at: DateTime<Utc>,
    pub bot_used: String,
    pub leaderboard_type: LeaderboardType,
    pub partition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoreSubmission {
    pub score: i64,
    /// Id of the bot that ran the course.
    pub bot_used: String,
}

impl ScoreSubmission {
    pub fn new(score: i64, bot_used: impl Into<String>) -> Self {
        Self {
            score,
            bot_used: bot_used.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmissionReceipt {
    pub entry_id: String,
    /// Partition ids the score was submitted to. The friends board is read from global rows and
    /// gets no write of its own.
    pub partitions: Vec<String>,
    pub outcome: WriteOutcome,
    pub new_high_score: bool,
    pub previous_best: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LeaderboardEvent {
    NewHighScore {
        player_id: String,
        score: i64,
        previous: Option<i64>,
    },
    RankChanged {
        partition_id: String,
        player_id: String,
        previous_rank: Option<u32>,
        new_rank: u32,
    },
    SnapshotUpdated {
        partition_id: String,
        entries: usize,
    },
}

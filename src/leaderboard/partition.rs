use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::keys;
use crate::error::{invalid_input, RunnerError, RunnerResult};
use crate::remote::{schema, CollectionPath};

/// Scope id of the never-resetting global board.
pub const ALL_TIME: &str = "all-time";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardType {
    Global,
    Weekly,
    Monthly,
    Daily,
    Friends,
    Tournament,
    Seasonal,
    BotSpecific,
}

impl LeaderboardType {
    pub const ALL: [LeaderboardType; 8] = [
        LeaderboardType::Global,
        LeaderboardType::Weekly,
        LeaderboardType::Monthly,
        LeaderboardType::Daily,
        LeaderboardType::Friends,
        LeaderboardType::Tournament,
        LeaderboardType::Seasonal,
        LeaderboardType::BotSpecific,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeaderboardType::Global => "global",
            LeaderboardType::Weekly => "weekly",
            LeaderboardType::Monthly => "monthly",
            LeaderboardType::Daily => "daily",
            LeaderboardType::Friends => "friends",
            LeaderboardType::Tournament => "tournament",
            LeaderboardType::Seasonal => "seasonal",
            LeaderboardType::BotSpecific => "bot_specific",
        }
    }

    /// Whether the partition id is derived from the submission time.
    pub fn is_time_bucketed(&self) -> bool {
        matches!(
            self,
            LeaderboardType::Daily
                | LeaderboardType::Weekly
                | LeaderboardType::Monthly
                | LeaderboardType::Seasonal
        )
    }
}

impl fmt::Display for LeaderboardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaderboardType {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LeaderboardType::ALL
            .into_iter()
            .find(|board| board.as_str() == s)
            .ok_or_else(|| invalid_input(format!("unknown leaderboard type '{s}'")))
    }
}

/// `yyyyMMdd` of the UTC day.
pub fn daily_id(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d").to_string()
}

/// Year plus week number, counting weeks from January 1st: day-of-year / 7 rounded up.
pub fn weekly_id(at: DateTime<Utc>) -> String {
    let week = at.ordinal().div_ceil(7);
    format!("{}-W{week:02}", at.year())
}

pub fn monthly_id(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

pub fn seasonal_id(at: DateTime<Utc>) -> String {
    format!("{}-Q{}", at.year(), at.month0() / 3 + 1)
}

/// One independently ranked leaderboard: a board type plus its scope.
///
/// The scope is the time bucket for bucketed boards, the tournament id, the bot id, the owning
/// player for a friends circle, and [`ALL_TIME`] for the global board.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    board: LeaderboardType,
    scope: String,
}

impl PartitionKey {
    pub fn new(board: LeaderboardType, scope: impl Into<String>) -> RunnerResult<Self> {
        let scope = scope.into();
        if scope.is_empty() || scope.contains('/') {
            return Err(invalid_input(format!(
                "invalid {board} leaderboard scope '{scope}'"
            )));
        }
        Ok(Self { board, scope })
    }

    pub fn global() -> Self {
        Self {
            board: LeaderboardType::Global,
            scope: ALL_TIME.to_string(),
        }
    }

    pub fn daily(at: DateTime<Utc>) -> Self {
        Self {
            board: LeaderboardType::Daily,
            scope: daily_id(at),
        }
    }

    pub fn weekly(at: DateTime<Utc>) -> Self {
        Self {
            board: LeaderboardType::Weekly,
            scope: weekly_id(at),
        }
    }

    pub fn monthly(at: DateTime<Utc>) -> Self {
        Self {
            board: LeaderboardType::Monthly,
            scope: monthly_id(at),
        }
    }

    pub fn seasonal(at: DateTime<Utc>) -> Self {
        Self {
            board: LeaderboardType::Seasonal,
            scope: seasonal_id(at),
        }
    }

    pub fn friends(player_id: &str) -> RunnerResult<Self> {
        Self::new(LeaderboardType::Friends, player_id)
    }

    pub fn tournament(tournament_id: &str) -> RunnerResult<Self> {
        Self::new(LeaderboardType::Tournament, tournament_id)
    }

    pub fn bot(bot_id: &str) -> RunnerResult<Self> {
        Self::new(LeaderboardType::BotSpecific, bot_id)
    }

    /// Every time-derived partition a score achieved at `at` belongs to, global included.
    pub fn time_partitions(at: DateTime<Utc>) -> Vec<Self> {
        vec![
            Self::global(),
            Self::daily(at),
            Self::weekly(at),
            Self::monthly(at),
            Self::seasonal(at),
        ]
    }

    pub fn board(&self) -> LeaderboardType {
        self.board
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Identifier used as the remote document id and in cache keys, e.g. `weekly_2026-W19`.
    pub fn id(&self) -> String {
        format!("{}_{}", self.board.as_str(), self.scope)
    }

    pub fn entries(&self) -> RunnerResult<CollectionPath> {
        schema::leaderboard_entries(&self.id())
    }

    /// Friends boards own no rows. They are read from the global board, filtered to the circle.
    pub fn is_derived(&self) -> bool {
        self.board == LeaderboardType::Friends
    }

    /// Collection the rows of this board live in.
    pub fn source_entries(&self) -> RunnerResult<CollectionPath> {
        if self.is_derived() {
            Self::global().entries()
        } else {
            self.entries()
        }
    }

    pub fn cache_key(&self) -> String {
        keys::leaderboard(&self.id())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

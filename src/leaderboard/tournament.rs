use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, tournament_full, tournament_inactive, RunnerResult};
use crate::model::{BotRecord, CurrencyBalances};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TournamentRules {
    /// Empty means every bot type is allowed.
    pub allowed_bot_types: BTreeSet<String>,
    pub max_bot_level: Option<u32>,
}

impl TournamentRules {
    /// Whether a run with `bot` may count. Unknown bots only pass unrestricted tournaments.
    pub fn admits(&self, bot: Option<&BotRecord>) -> bool {
        let unrestricted = self.allowed_bot_types.is_empty() && self.max_bot_level.is_none();
        let Some(bot) = bot else {
            return unrestricted;
        };
        let type_ok =
            self.allowed_bot_types.is_empty() || self.allowed_bot_types.contains(&bot.bot_type);
        let level_ok = self.max_bot_level.map_or(true, |max| bot.level <= max);
        type_ok && level_ok
    }
}

/// Rewards for final ranks `min_rank..=max_rank`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardTier {
    pub min_rank: u32,
    pub max_rank: u32,
    pub rewards: CurrencyBalances,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tournament {
    pub tournament_id: String,
    #[serde(default)]
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_participants: u32,
    #[serde(default)]
    pub participant_ids: BTreeSet<String>,
    #[serde(default)]
    pub rules: TournamentRules,
    #[serde(default)]
    pub reward_tiers: Vec<RewardTier>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Repeat join; nothing changed.
    AlreadyMember,
}

impl Tournament {
    /// Active over `[start_time, end_time)`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.end_time
    }

    pub fn current_participants(&self) -> u32 {
        self.participant_ids.len() as u32
    }

    pub fn is_member(&self, player_id: &str) -> bool {
        self.participant_ids.contains(player_id)
    }

    pub fn check_join(&self, player_id: &str, now: DateTime<Utc>) -> RunnerResult<JoinOutcome> {
        if !self.is_active(now) {
            return Err(tournament_inactive(format!(
                "tournament {} is not running",
                self.tournament_id
            )));
        }
        if self.is_member(player_id) {
            return Ok(JoinOutcome::AlreadyMember);
        }
        if self.current_participants() >= self.max_participants {
            return Err(tournament_full(format!(
                "tournament {} is full ({} players)",
                self.tournament_id, self.max_participants
            )));
        }
        Ok(JoinOutcome::Joined)
    }

    pub fn reward_for_rank(&self, rank: u32) -> Option<&RewardTier> {
        self.reward_tiers
            .iter()
            .find(|tier| tier.min_rank <= rank && rank <= tier.max_rank)
    }

    pub fn validate(&self) -> RunnerResult<()> {
        if self.tournament_id.trim().is_empty() {
            return Err(invalid_input("tournament id cannot be empty"));
        }
        if self.start_time > self.end_time {
            return Err(invalid_input(format!(
                "tournament {} ends before it starts",
                self.tournament_id
            )));
        }
        if self.max_participants == 0 || self.current_participants() > self.max_participants {
            return Err(invalid_input(format!(
                "tournament {} has an invalid capacity",
                self.tournament_id
            )));
        }
        for tier in &self.reward_tiers {
            if tier.min_rank == 0 || tier.min_rank > tier.max_rank {
                return Err(invalid_input(format!(
                    "reward tier {}..{} is not a valid rank range",
                    tier.min_rank, tier.max_rank
                )));
            }
            tier.rewards.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerErrorCode;
    use crate::model::CurrencyType;
    use chrono::{Duration, TimeZone};

    fn cup(capacity: u32) -> Tournament {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        Tournament {
            tournament_id: "summer-cup".into(),
            name: "Summer Cup".into(),
            start_time: start,
            end_time: start + Duration::days(7),
            max_participants: capacity,
            participant_ids: BTreeSet::new(),
            rules: TournamentRules::default(),
            reward_tiers: vec![RewardTier {
                min_rank: 1,
                max_rank: 3,
                rewards: CurrencyBalances::new().with(CurrencyType::Gems, 100),
            }],
        }
    }

    #[test]
    fn window_is_half_open() {
        let t = cup(2);
        assert!(!t.is_active(t.start_time - Duration::seconds(1)));
        assert!(t.is_active(t.start_time));
        assert!(!t.is_active(t.end_time));
        let err = t.check_join("p1", t.end_time).unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::TournamentInactive);
    }

    #[test]
    fn capacity_and_repeat_joins() {
        let mut t = cup(1);
        let now = t.start_time + Duration::hours(1);
        assert_eq!(t.check_join("p1", now).unwrap(), JoinOutcome::Joined);
        t.participant_ids.insert("p1".into());
        assert_eq!(t.check_join("p1", now).unwrap(), JoinOutcome::AlreadyMember);
        assert_eq!(
            t.check_join("p2", now).unwrap_err().code,
            RunnerErrorCode::TournamentFull
        );
    }

    #[test]
    fn rules_filter_bots() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let mut bot = BotRecord::new("p1", "b1", "sprinter", now);
        bot.level = 12;
        let rules = TournamentRules {
            allowed_bot_types: BTreeSet::from(["sprinter".to_string()]),
            max_bot_level: Some(10),
        };
        assert!(!rules.admits(Some(&bot)));
        bot.level = 10;
        assert!(rules.admits(Some(&bot)));
        assert!(!rules.admits(None));
        assert!(TournamentRules::default().admits(None));
    }

    #[test]
    fn reward_lookup() {
        let t = cup(10);
        assert!(t.reward_for_rank(2).is_some());
        assert!(t.reward_for_rank(4).is_none());
        t.validate().unwrap();
    }
}

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, RunnerResult};
use crate::model::currency::CurrencyBalances;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerStats {
    pub total_runs: u64,
    pub total_distance: u64,
    pub best_score: i64,
    pub races_won: u64,
    pub bots_built: u64,
}

/// Spend bracket used for offer targeting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendSegment {
    #[default]
    NonPayer,
    Minnow,
    Dolphin,
    Whale,
}

impl SpendSegment {
    pub fn from_total_spent(total_spent_cents: u64) -> Self {
        match total_spent_cents {
            0 => SpendSegment::NonPayer,
            1..=1_999 => SpendSegment::Minnow,
            2_000..=9_999 => SpendSegment::Dolphin,
            _ => SpendSegment::Whale,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonetizationSummary {
    pub total_spent_cents: u64,
    pub purchase_count: u32,
    pub segment: SpendSegment,
}

impl MonetizationSummary {
    pub fn record_purchase(&mut self, price_cents: u64) {
        self.total_spent_cents = self.total_spent_cents.saturating_add(price_cents);
        self.purchase_count = self.purchase_count.saturating_add(1);
        self.segment = SpendSegment::from_total_spent(self.total_spent_cents);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerSettings {
    pub sound_enabled: bool,
    pub music_enabled: bool,
    pub notifications_enabled: bool,
    pub language: String,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            sound_enabled: true,
            music_enabled: true,
            notifications_enabled: true,
            language: "en".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerProfile {
    pub player_id: String,
    #[serde(default)]
    pub display_name: String,
    pub level: u32,
    #[serde(default)]
    pub experience: u64,
    #[serde(default)]
    pub currencies: CurrencyBalances,
    #[serde(default)]
    pub stats: PlayerStats,
    #[serde(default)]
    pub friend_ids: BTreeSet<String>,
    #[serde(default)]
    pub monetization: MonetizationSummary,
    #[serde(default)]
    pub settings: PlayerSettings,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
    /// Version marker of the last local write folded into this document.
    #[serde(default)]
    pub sync_version: u64,
}

impl PlayerProfile {
    /// Document fields that only move by increments. A queued edit replays them as deltas when
    /// it has to be applied on top of a newer remote copy.
    pub const COUNTER_FIELDS: &'static [&'static str] = &[
        "currencies.*",
        "experience",
        "stats.totalRuns",
        "stats.totalDistance",
        "stats.racesWon",
        "stats.botsBuilt",
        "monetization.totalSpentCents",
        "monetization.purchaseCount",
    ];

    /// Document fields that never decrease.
    pub const HIGH_WATER_FIELDS: &'static [&'static str] = &["stats.bestScore"];

    /// Profile handed to a player on their first session.
    pub fn new_default(
        player_id: impl Into<String>,
        starting_balances: CurrencyBalances,
        now: DateTime<Utc>,
    ) -> Self {
        let player_id = player_id.into();
        let suffix: String = player_id.chars().take(6).collect();
        Self {
            display_name: format!("Runner-{suffix}"),
            player_id,
            level: 1,
            experience: 0,
            currencies: starting_balances,
            stats: PlayerStats::default(),
            friend_ids: BTreeSet::new(),
            monetization: MonetizationSummary::default(),
            settings: PlayerSettings::default(),
            created_at: now,
            last_login_at: now,
            sync_version: 0,
        }
    }

    pub fn validate(&self) -> RunnerResult<()> {
        if self.player_id.trim().is_empty() {
            return Err(invalid_input("profile is missing a player id"));
        }
        if self.level < 1 {
            return Err(invalid_input(format!(
                "profile level must be at least 1, got {}",
                self.level
            )));
        }
        if self.friend_ids.contains(&self.player_id) {
            return Err(invalid_input("a player cannot befriend themselves"));
        }
        self.currencies.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CurrencyType;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    #[test]
    fn default_profile_starts_at_level_one() {
        let balances = CurrencyBalances::new().with(CurrencyType::Coins, 1000);
        let profile = PlayerProfile::new_default("player-123456789", balances, now());
        assert_eq!(profile.level, 1);
        assert_eq!(profile.display_name, "Runner-player");
        assert_eq!(profile.currencies.get(CurrencyType::Coins), 1000);
        profile.validate().unwrap();
    }

    #[test]
    fn validation_rules() {
        let mut profile = PlayerProfile::new_default("p1", CurrencyBalances::new(), now());
        profile.level = 0;
        assert!(profile.validate().is_err());
        profile.level = 3;
        profile.currencies.set(CurrencyType::Gems, -1);
        assert!(profile.validate().is_err());
        profile.currencies.set(CurrencyType::Gems, 0);
        profile.player_id = " ".into();
        assert!(profile.validate().is_err());
    }

    #[test]
    fn segment_thresholds() {
        let mut summary = MonetizationSummary::default();
        summary.record_purchase(499);
        assert_eq!(summary.segment, SpendSegment::Minnow);
        summary.record_purchase(4_999);
        assert_eq!(summary.segment, SpendSegment::Dolphin);
        summary.record_purchase(9_999);
        assert_eq!(summary.segment, SpendSegment::Whale);
        assert_eq!(summary.purchase_count, 3);
    }

    #[test]
    fn decodes_camel_case_documents() {
        let json = serde_json::json!({
            "playerId": "p1",
            "level": 4,
            "friendIds": ["p2", "p2", "p3"],
            "createdAt": "2026-05-04T09:00:00Z",
            "lastLoginAt": "2026-05-04T09:00:00Z",
        });
        let profile: PlayerProfile = serde_json::from_value(json).unwrap();
        assert_eq!(profile.friend_ids.len(), 2);
        assert_eq!(profile.sync_version, 0);
    }
}

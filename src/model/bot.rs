use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{invalid_input, RunnerResult};

pub const MIN_STAT: u8 = 1;
pub const MAX_STAT: u8 = 100;
pub const MIN_BOT_LEVEL: u32 = 1;
pub const MAX_BOT_LEVEL: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotStats {
    pub speed: u8,
    pub power: u8,
    pub agility: u8,
    pub intelligence: u8,
}

impl Default for BotStats {
    fn default() -> Self {
        Self {
            speed: 10,
            power: 10,
            agility: 10,
            intelligence: 10,
        }
    }
}

impl BotStats {
    fn named(&self) -> [(&'static str, u8); 4] {
        [
            ("speed", self.speed),
            ("power", self.power),
            ("agility", self.agility),
            ("intelligence", self.intelligence),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotRecord {
    pub bot_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bot_type: String,
    #[serde(default)]
    pub stats: BotStats,
    pub level: u32,
    #[serde(default)]
    pub upgrade_levels: BTreeMap<String, u32>,
    #[serde(default)]
    pub customization: Value,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub rating: f64,
    pub last_modified: DateTime<Utc>,
}

impl BotRecord {
    pub fn new(
        owner_id: impl Into<String>,
        bot_id: impl Into<String>,
        bot_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            owner_id: owner_id.into(),
            name: String::new(),
            bot_type: bot_type.into(),
            stats: BotStats::default(),
            level: MIN_BOT_LEVEL,
            upgrade_levels: BTreeMap::new(),
            customization: Value::Null,
            is_public: false,
            rating: 0.0,
            last_modified: now,
        }
    }

    pub fn validate(&self) -> RunnerResult<()> {
        if self.bot_id.trim().is_empty() || self.owner_id.trim().is_empty() {
            return Err(invalid_input("bots need both an owner id and a bot id"));
        }
        for (name, value) in self.stats.named() {
            if !(MIN_STAT..=MAX_STAT).contains(&value) {
                return Err(invalid_input(format!(
                    "bot {} stat {name} must be within {MIN_STAT}..={MAX_STAT}, got {value}",
                    self.bot_id
                )));
            }
        }
        if !(MIN_BOT_LEVEL..=MAX_BOT_LEVEL).contains(&self.level) {
            return Err(invalid_input(format!(
                "bot {} level must be within {MIN_BOT_LEVEL}..={MAX_BOT_LEVEL}, got {}",
                self.bot_id, self.level
            )));
        }
        if let Some((upgrade, level)) = self.upgrade_levels.iter().find(|(_, level)| **level < 1) {
            return Err(invalid_input(format!(
                "bot {} upgrade {upgrade} must be at least 1, got {level}",
                self.bot_id
            )));
        }
        if !self.rating.is_finite() {
            return Err(invalid_input("bot rating must be a finite number"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bot() -> BotRecord {
        BotRecord::new(
            "p1",
            "b1",
            "sprinter",
            Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap(),
        )
    }

    #[test]
    fn stat_and_level_bounds_are_inclusive() {
        let mut record = bot();
        record.stats.speed = 100;
        record.stats.power = 1;
        record.level = 100;
        record.validate().unwrap();

        record.stats.agility = 0;
        assert!(record.validate().is_err());
        record.stats.agility = 101;
        assert!(record.validate().is_err());
        record.stats.agility = 50;
        record.level = 101;
        assert!(record.validate().is_err());
    }

    #[test]
    fn upgrade_levels_start_at_one() {
        let mut record = bot();
        record.upgrade_levels.insert("booster".into(), 0);
        assert!(record.validate().is_err());
        record.upgrade_levels.insert("booster".into(), 1);
        record.validate().unwrap();
    }
}

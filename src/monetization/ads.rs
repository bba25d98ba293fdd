use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::CurrencyType;

/// Currency granted for watching one rewarded ad.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdReward {
    pub currency: CurrencyType,
    pub amount: i64,
}

/// Ad-platform report that a rewarded ad finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdCompleted {
    pub placement: String,
    pub reward: AdReward,
}

impl AdCompleted {
    pub fn new(placement: impl Into<String>, currency: CurrencyType, amount: i64) -> Self {
        Self {
            placement: placement.into(),
            reward: AdReward { currency, amount },
        }
    }

    pub fn source(&self) -> String {
        format!("ad_{}", self.placement)
    }
}

/// Rewarded views per placement for one UTC day.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AdCounters {
    day: Option<NaiveDate>,
    views: BTreeMap<String, u32>,
}

impl AdCounters {
    pub(crate) fn views(&self, placement: &str, now: DateTime<Utc>) -> u32 {
        if self.day != Some(now.date_naive()) {
            return 0;
        }
        self.views.get(placement).copied().unwrap_or(0)
    }

    pub(crate) fn record(&mut self, placement: &str, now: DateTime<Utc>) -> u32 {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.views.clear();
        }
        let views = self.views.entry(placement.to_string()).or_insert(0);
        *views += 1;
        *views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn counters_reset_at_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 23, 50, 0).unwrap();
        let mut counters = AdCounters::default();
        assert_eq!(counters.record("shop", now), 1);
        assert_eq!(counters.record("shop", now), 2);
        assert_eq!(counters.record("revive", now), 1);
        assert_eq!(counters.views("shop", now), 2);

        let tomorrow = now + Duration::minutes(20);
        assert_eq!(counters.views("shop", tomorrow), 0);
        assert_eq!(counters.record("shop", tomorrow), 1);
        assert_eq!(counters.views("revive", tomorrow), 0);
    }

    #[test]
    fn source_tags_the_placement() {
        let ad = AdCompleted::new("revive", CurrencyType::Coins, 50);
        assert_eq!(ad.source(), "ad_revive");
    }
}

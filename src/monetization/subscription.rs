use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Active,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionTransition {
    Activated,
    Renewed,
    Expired,
    Deactivated,
}

impl SubscriptionTransition {
    /// Rewards follow purchases only, never a status check.
    pub fn grants_reward(&self) -> bool {
        matches!(
            self,
            SubscriptionTransition::Activated | SubscriptionTransition::Renewed
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionState {
    pub product_id: String,
    #[serde(default)]
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub will_renew: bool,
    #[serde(default)]
    pub renewals: u32,
    #[serde(default)]
    pub last_granted_at: Option<DateTime<Utc>>,
}

impl SubscriptionState {
    pub fn new(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            status: SubscriptionStatus::Inactive,
            expiration_date: None,
            will_renew: false,
            renewals: 0,
            last_granted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Applies a completed subscription purchase.
    ///
    /// While still active the new period is added to the current expiration; otherwise it starts
    /// at `now`.
    pub fn purchase(&mut self, now: DateTime<Utc>, period: Duration) -> SubscriptionTransition {
        let transition = match (self.status, self.expiration_date) {
            (SubscriptionStatus::Active, Some(expiration)) if expiration >= now => {
                self.expiration_date = Some(expiration + period);
                self.renewals += 1;
                SubscriptionTransition::Renewed
            }
            _ => {
                self.expiration_date = Some(now + period);
                self.renewals = 0;
                SubscriptionTransition::Activated
            }
        };
        self.status = SubscriptionStatus::Active;
        self.will_renew = true;
        self.last_granted_at = Some(now);
        transition
    }

    /// Periodic status check. Never grants anything.
    pub fn check(&mut self, now: DateTime<Utc>, grace: Duration) -> Option<SubscriptionTransition> {
        let expiration = self.expiration_date?;
        match self.status {
            SubscriptionStatus::Active if now > expiration => {
                self.status = SubscriptionStatus::Expired;
                self.will_renew = false;
                Some(SubscriptionTransition::Expired)
            }
            SubscriptionStatus::Expired if now > expiration + grace => {
                self.status = SubscriptionStatus::Inactive;
                Some(SubscriptionTransition::Deactivated)
            }
            _ => None,
        }
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, RunnerResult};
use crate::model::{CurrencyBalances, CurrencyType};

pub const DEFAULT_DAILY_SPEND_LIMIT_CENTS: u64 = 50_000;
pub const DEFAULT_HOURLY_PRODUCT_CAP: u32 = 5;
pub const DEFAULT_SUSPICIOUS_THRESHOLD: u32 = 3;
pub const DEFAULT_SUBSCRIPTION_PERIOD_MILLIS: u64 = 30 * 24 * 60 * 60 * 1_000;
pub const DEFAULT_SUBSCRIPTION_GRACE_MILLIS: u64 = 3 * 24 * 60 * 60 * 1_000;
pub const DEFAULT_SUBSCRIPTION_CHECK_INTERVAL_MILLIS: u64 = 60 * 60 * 1_000;
pub const DEFAULT_AD_DAILY_CAP: u32 = 10;
/// Confirmed ledger rows kept on the device per currency; older ones are folded into a sum.
pub const DEFAULT_LEDGER_CACHE_WINDOW: usize = 50;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    #[default]
    Consumable,
    /// Recurring; `rewards` are granted once per activation or renewal.
    Subscription,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDefinition {
    pub product_id: String,
    pub price_cents: u64,
    #[serde(default = "default_currency_code")]
    pub currency_code: String,
    #[serde(default)]
    pub kind: ProductKind,
    #[serde(default)]
    pub rewards: CurrencyBalances,
}

fn default_currency_code() -> String {
    "USD".to_string()
}

impl ProductDefinition {
    pub fn consumable(product_id: &str, price_cents: u64, rewards: CurrencyBalances) -> Self {
        Self {
            product_id: product_id.to_string(),
            price_cents,
            currency_code: default_currency_code(),
            kind: ProductKind::Consumable,
            rewards,
        }
    }

    pub fn subscription(product_id: &str, price_cents: u64, rewards: CurrencyBalances) -> Self {
        Self {
            kind: ProductKind::Subscription,
            ..Self::consumable(product_id, price_cents, rewards)
        }
    }
}

fn default_products() -> Vec<ProductDefinition> {
    vec![
        ProductDefinition::consumable(
            "gems_small",
            199,
            CurrencyBalances::new().with(CurrencyType::Gems, 100),
        ),
        ProductDefinition::consumable(
            "gems_large",
            999,
            CurrencyBalances::new().with(CurrencyType::Gems, 600),
        ),
        ProductDefinition::consumable(
            "starter_bundle",
            499,
            CurrencyBalances::new()
                .with(CurrencyType::Coins, 5_000)
                .with(CurrencyType::Gems, 100)
                .with(CurrencyType::Energy, 50),
        ),
        ProductDefinition::subscription(
            "vip_monthly",
            799,
            CurrencyBalances::new()
                .with(CurrencyType::Gems, 300)
                .with(CurrencyType::Tickets, 5),
        ),
    ]
}

fn default_caps() -> BTreeMap<CurrencyType, i64> {
    BTreeMap::from([
        (CurrencyType::Coins, 10_000_000),
        (CurrencyType::Gems, 1_000_000),
        (CurrencyType::Energy, 1_000),
        (CurrencyType::Tickets, 999),
    ])
}

/// Ledger limits, fraud gates, subscription timing and the product catalogue.
///
/// The numeric limits are tuning values; nothing in the ledger depends on their magnitude.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonetizationSettings {
    /// Balance ceiling per currency. A currency without an entry is uncapped.
    pub currency_caps: BTreeMap<CurrencyType, i64>,
    pub daily_spend_limit_cents: u64,
    /// Completed purchases of one product allowed within a rolling hour.
    pub hourly_product_cap: u32,
    /// Rejected receipts for one product before further attempts are declined.
    pub suspicious_threshold: u32,
    pub subscription_period_millis: u64,
    /// How long an expired subscription stays `Expired` before it reads as `Inactive`.
    pub subscription_grace_millis: u64,
    pub subscription_check_interval_millis: u64,
    /// Rewarded ads per placement per UTC day.
    pub ad_daily_cap: u32,
    pub ledger_cache_window: usize,
    pub products: Vec<ProductDefinition>,
}

impl Default for MonetizationSettings {
    fn default() -> Self {
        Self {
            currency_caps: default_caps(),
            daily_spend_limit_cents: DEFAULT_DAILY_SPEND_LIMIT_CENTS,
            hourly_product_cap: DEFAULT_HOURLY_PRODUCT_CAP,
            suspicious_threshold: DEFAULT_SUSPICIOUS_THRESHOLD,
            subscription_period_millis: DEFAULT_SUBSCRIPTION_PERIOD_MILLIS,
            subscription_grace_millis: DEFAULT_SUBSCRIPTION_GRACE_MILLIS,
            subscription_check_interval_millis: DEFAULT_SUBSCRIPTION_CHECK_INTERVAL_MILLIS,
            ad_daily_cap: DEFAULT_AD_DAILY_CAP,
            ledger_cache_window: DEFAULT_LEDGER_CACHE_WINDOW,
            products: default_products(),
        }
    }
}

impl MonetizationSettings {
    pub fn cap(&self, currency: CurrencyType) -> Option<i64> {
        self.currency_caps.get(&currency).copied()
    }

    pub fn product(&self, product_id: &str) -> Option<&ProductDefinition> {
        self.products
            .iter()
            .find(|product| product.product_id == product_id)
    }

    pub fn subscription_products(&self) -> impl Iterator<Item = &ProductDefinition> {
        self.products
            .iter()
            .filter(|product| product.kind == ProductKind::Subscription)
    }

    pub fn validate(&self) -> RunnerResult<()> {
        if let Some((currency, cap)) = self.currency_caps.iter().find(|(_, cap)| **cap <= 0) {
            return Err(invalid_input(format!(
                "monetization.currency_caps.{currency} must be positive, got {cap}"
            )));
        }
        let positive = [
            ("monetization.hourly_product_cap", self.hourly_product_cap as u64),
            ("monetization.suspicious_threshold", self.suspicious_threshold as u64),
            ("monetization.subscription_period_millis", self.subscription_period_millis),
            (
                "monetization.subscription_check_interval_millis",
                self.subscription_check_interval_millis,
            ),
            ("monetization.ledger_cache_window", self.ledger_cache_window as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(invalid_input(format!("{name} must be positive")));
        }

        let mut seen = std::collections::BTreeSet::new();
        for product in &self.products {
            if product.product_id.trim().is_empty() || !seen.insert(product.product_id.as_str()) {
                return Err(invalid_input(format!(
                    "product id '{}' is empty or duplicated",
                    product.product_id
                )));
            }
            product.rewards.validate()?;
        }
        Ok(())
    }
}

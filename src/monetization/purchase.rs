use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RunnerResult;
use crate::monetization::config::{MonetizationSettings, ProductDefinition};

/// Store-layer report that a purchase went through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseSucceeded {
    pub product_id: String,
    pub transaction_id: String,
    pub price_cents: u64,
    pub currency_code: String,
    /// Opaque platform receipt. Only its fingerprint is persisted.
    pub receipt: String,
}

impl PurchaseSucceeded {
    pub fn new(
        product_id: impl Into<String>,
        transaction_id: impl Into<String>,
        price_cents: u64,
        receipt: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            transaction_id: transaction_id.into(),
            price_cents,
            currency_code: "USD".to_string(),
            receipt: receipt.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRecord {
    pub transaction_id: String,
    pub product_id: String,
    pub price_cents: u64,
    pub currency_code: String,
    pub receipt_fingerprint: String,
    pub purchased_at: DateTime<Utc>,
}

impl PurchaseRecord {
    pub fn from_purchase(purchase: &PurchaseSucceeded, purchased_at: DateTime<Utc>) -> Self {
        Self {
            transaction_id: purchase.transaction_id.clone(),
            product_id: purchase.product_id.clone(),
            price_cents: purchase.price_cents,
            currency_code: purchase.currency_code.clone(),
            receipt_fingerprint: receipt_fingerprint(&purchase.receipt),
            purchased_at,
        }
    }
}

/// Lowercase hex SHA-256 of the receipt.
pub fn receipt_fingerprint(receipt: &str) -> String {
    let digest = Sha256::digest(receipt.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeclineReason {
    UnknownProduct,
    HourlyProductCap { purchases: u32, cap: u32 },
    DailySpendLimit { spent_cents: u64, limit_cents: u64 },
    SuspiciousActivity { flags: u32 },
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::UnknownProduct => "unknown_product",
            DeclineReason::HourlyProductCap { .. } => "hourly_product_cap",
            DeclineReason::DailySpendLimit { .. } => "daily_spend_limit",
            DeclineReason::SuspiciousActivity { .. } => "suspicious_activity",
        }
    }
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclineReason::UnknownProduct => write!(f, "product is not in the catalogue"),
            DeclineReason::HourlyProductCap { purchases, cap } => {
                write!(f, "{purchases} purchases this hour (cap {cap})")
            }
            DeclineReason::DailySpendLimit {
                spent_cents,
                limit_cents,
            } => write!(f, "{spent_cents} cents spent today (limit {limit_cents})"),
            DeclineReason::SuspiciousActivity { flags } => {
                write!(f, "{flags} rejected receipts for this product")
            }
        }
    }
}

/// Result of the pre-purchase gate. A decline is an ordinary answer, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PurchaseDecision {
    Allowed,
    Declined { reason: DeclineReason },
}

impl PurchaseDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PurchaseDecision::Allowed)
    }
}

/// Rejected receipt counts per product id.
pub type FraudFlags = BTreeMap<String, u32>;

/// Runs the velocity gates against the local purchase history.
///
/// The hourly window is rolling; the daily window is the current UTC date.
pub(crate) fn evaluate_gate(
    settings: &MonetizationSettings,
    product: &ProductDefinition,
    history: &[PurchaseRecord],
    flags: &FraudFlags,
    now: DateTime<Utc>,
) -> PurchaseDecision {
    let hour_ago = now - Duration::hours(1);
    let purchases = history
        .iter()
        .filter(|record| record.product_id == product.product_id && record.purchased_at > hour_ago)
        .count() as u32;
    if purchases >= settings.hourly_product_cap {
        return PurchaseDecision::Declined {
            reason: DeclineReason::HourlyProductCap {
                purchases,
                cap: settings.hourly_product_cap,
            },
        };
    }

    let today = now.date_naive();
    let spent_cents: u64 = history
        .iter()
        .filter(|record| record.purchased_at.date_naive() == today)
        .map(|record| record.price_cents)
        .sum();
    if spent_cents.saturating_add(product.price_cents) > settings.daily_spend_limit_cents {
        return PurchaseDecision::Declined {
            reason: DeclineReason::DailySpendLimit {
                spent_cents,
                limit_cents: settings.daily_spend_limit_cents,
            },
        };
    }

    let flagged = flags.get(&product.product_id).copied().unwrap_or(0);
    if flagged >= settings.suspicious_threshold {
        return PurchaseDecision::Declined {
            reason: DeclineReason::SuspiciousActivity { flags: flagged },
        };
    }
    PurchaseDecision::Allowed
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiptVerdict {
    Valid,
    Rejected { reason: String },
}

/// Yes/no oracle for platform receipts.
#[async_trait]
pub trait ReceiptValidator: Send + Sync {
    async fn validate(
        &self,
        player_id: &str,
        purchase: &PurchaseSucceeded,
    ) -> RunnerResult<ReceiptVerdict>;
}

pub type ReceiptValidatorArc = Arc<dyn ReceiptValidator>;

/// Accepts every non-empty receipt except the ones explicitly marked as rejected.
#[derive(Clone, Debug, Default)]
pub struct StaticReceiptValidator {
    rejected: Arc<Mutex<BTreeSet<String>>>,
}

impl StaticReceiptValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_receipt(&self, receipt: impl Into<String>) {
        self.rejected.lock().unwrap().insert(receipt.into());
    }
}

#[async_trait]
impl ReceiptValidator for StaticReceiptValidator {
    async fn validate(
        &self,
        _player_id: &str,
        purchase: &PurchaseSucceeded,
    ) -> RunnerResult<ReceiptVerdict> {
        if purchase.receipt.trim().is_empty() {
            return Ok(ReceiptVerdict::Rejected {
                reason: "empty receipt".to_string(),
            });
        }
        if self.rejected.lock().unwrap().contains(&purchase.receipt) {
            return Ok(ReceiptVerdict::Rejected {
                reason: "receipt rejected by store".to_string(),
            });
        }
        Ok(ReceiptVerdict::Valid)
    }
}

//! Monetization Ledger.
//!
//! Balances live on the player profile; every movement also appends an immutable transaction row,
//! written in the same batch as the balance change. Purchases, subscription grants and rewarded
//! ads all credit through the ledger.

mod ads;
mod config;
mod ledger;
mod purchase;
mod service;
mod subscription;

pub use ads::{AdCompleted, AdReward};
pub use config::{
    MonetizationSettings, ProductDefinition, ProductKind, DEFAULT_AD_DAILY_CAP,
    DEFAULT_DAILY_SPEND_LIMIT_CENTS, DEFAULT_HOURLY_PRODUCT_CAP,
    DEFAULT_SUBSCRIPTION_CHECK_INTERVAL_MILLIS, DEFAULT_SUBSCRIPTION_GRACE_MILLIS,
    DEFAULT_SUBSCRIPTION_PERIOD_MILLIS, DEFAULT_SUSPICIOUS_THRESHOLD,
};
pub use ledger::{
    CurrencyLedger, CurrencyTransaction, LedgerReceipt, MonetizationEvent, ReconcileSource,
    Reconciliation,
};
pub use purchase::{
    receipt_fingerprint, DeclineReason, FraudFlags, PurchaseDecision, PurchaseRecord,
    PurchaseSucceeded, ReceiptValidator, ReceiptValidatorArc, ReceiptVerdict,
    StaticReceiptValidator,
};
pub use service::{MonetizationService, PurchaseReceipt};
pub use subscription::{SubscriptionState, SubscriptionStatus, SubscriptionTransition};

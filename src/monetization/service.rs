use std::sync::{Arc, LazyLock, Mutex};

use chrono::Duration;

use crate::analytics::MetricEvent;
use crate::cache::keys;
use crate::error::{
    duplicate_transaction, invalid_input, limit_exceeded, not_found, RunnerErrorCode,
    RunnerResult,
};
use crate::identity::require_user;
use crate::logger::Logger;
use crate::monetization::ads::{AdCompleted, AdCounters};
use crate::monetization::config::{MonetizationSettings, ProductDefinition, ProductKind};
use crate::monetization::ledger::{
    reward_lines, CurrencyLedger, LedgerReceipt, MonetizationEvent,
};
use crate::monetization::purchase::{
    evaluate_gate, DeclineReason, FraudFlags, PurchaseDecision, PurchaseRecord,
    PurchaseSucceeded, ReceiptValidatorArc, ReceiptVerdict,
};
use crate::monetization::subscription::{
    SubscriptionState, SubscriptionTransition,
};
use crate::remote::{encode_document, schema, DocumentPath, WriteOperation};
use crate::sync::{SyncEngine, SyncEvent};
use crate::util::Subscription;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@runner/monetization"));

#[derive(Clone, Debug, PartialEq)]
pub struct PurchaseReceipt {
    pub record: PurchaseRecord,
    pub credits: LedgerReceipt,
    /// Present for subscription products.
    pub subscription: Option<SubscriptionState>,
}

/// Purchases, subscriptions and rewarded ads on top of the [`CurrencyLedger`].
#[derive(Clone)]
pub struct MonetizationService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    ledger: CurrencyLedger,
    validator: Option<ReceiptValidatorArc>,
    rejections: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for MonetizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonetizationService")
            .field("validates_receipts", &self.inner.validator.is_some())
            .finish()
    }
}

impl MonetizationService {
    pub fn new(ledger: CurrencyLedger, validator: Option<ReceiptValidatorArc>) -> Self {
        let service = Self {
            inner: Arc::new(ServiceInner {
                ledger,
                validator,
                rejections: Mutex::new(None),
            }),
        };
        let weak = Arc::downgrade(&service.inner);
        let subscription = service.sync().subscribe(move |event| {
            if let SyncEvent::WriteRejected { paths, reason } = event {
                if let Some(inner) = weak.upgrade() {
                    MonetizationService { inner }.revert_purchases(paths, reason);
                }
            }
        });
        *service.inner.rejections.lock().unwrap() = Some(subscription);
        service
    }

    pub fn ledger(&self) -> &CurrencyLedger {
        &self.inner.ledger
    }

    fn sync(&self) -> &SyncEngine {
        self.inner.ledger.sync()
    }

    fn settings(&self) -> &MonetizationSettings {
        self.inner.ledger.settings()
    }

    fn current_player(&self) -> RunnerResult<String> {
        require_user(self.inner.ledger.identity().as_ref())
    }

    /// Completed purchases recorded on this device, oldest first.
    pub fn purchase_history(&self) -> RunnerResult<Vec<PurchaseRecord>> {
        let player_id = self.current_player()?;
        Ok(self.history_of(&player_id))
    }

    fn history_of(&self, player_id: &str) -> Vec<PurchaseRecord> {
        self.sync()
            .read_cached::<Vec<PurchaseRecord>>(&keys::purchases(player_id))
            .map(|blob| blob.value)
            .unwrap_or_default()
    }

    fn fraud_flags(&self, player_id: &str) -> FraudFlags {
        self.sync()
            .read_cached::<FraudFlags>(&keys::fraud_flags(player_id))
            .map(|blob| blob.value)
            .unwrap_or_default()
    }

    /// Gate run before asking the store for a purchase.
    pub fn check_purchase_allowed(&self, product_id: &str) -> RunnerResult<PurchaseDecision> {
        let player_id = self.current_player()?;
        let decision = match self.settings().product(product_id) {
            Some(product) => evaluate_gate(
                self.settings(),
                product,
                &self.history_of(&player_id),
                &self.fraud_flags(&player_id),
                self.sync().now(),
            ),
            None => PurchaseDecision::Declined {
                reason: DeclineReason::UnknownProduct,
            },
        };
        if let PurchaseDecision::Declined { reason } = &decision {
            LOGGER.info(format!("declined {product_id} for {player_id}: {reason}"));
            self.declined(product_id, reason.as_str());
        }
        Ok(decision)
    }

    fn declined(&self, product_id: &str, reason: &str) {
        self.sync().analytics().log_event(&MetricEvent::PurchaseDeclined {
            product_id: product_id.to_string(),
            reason: reason.to_string(),
        });
        self.inner.ledger.publish(MonetizationEvent::PurchaseDeclined {
            product_id: product_id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Credits a purchase reported by the store layer.
    ///
    /// Replayed callbacks carrying an already recorded transaction id fail with
    /// `DuplicateTransaction` and credit nothing.
    pub async fn complete_purchase(
        &self,
        purchase: PurchaseSucceeded,
    ) -> RunnerResult<PurchaseReceipt> {
        let player_id = self.current_player()?;
        if purchase.transaction_id.trim().is_empty() || purchase.transaction_id.contains('/') {
            return Err(invalid_input(format!(
                "invalid transaction id '{}'",
                purchase.transaction_id
            )));
        }
        let product = self
            .settings()
            .product(&purchase.product_id)
            .cloned()
            .ok_or_else(|| not_found(format!("unknown product {}", purchase.product_id)))?;

        let _guard = self
            .sync()
            .lock_resource(&format!("purchase:{player_id}"))
            .await;
        self.ensure_new_transaction(&player_id, &purchase).await?;

        if let Some(validator) = &self.inner.validator {
            if let ReceiptVerdict::Rejected { reason } =
                validator.validate(&player_id, &purchase).await?
            {
                let flags = self.flag_product(&player_id, &product.product_id);
                LOGGER.warn(format!(
                    "receipt for {} rejected ({reason}); {flags} flags on {}",
                    purchase.transaction_id, product.product_id
                ));
                self.declined(&product.product_id, "receipt_rejected");
                return Err(invalid_input(format!("receipt rejected: {reason}")));
            }
        }

        let now = self.sync().now();
        let record = PurchaseRecord::from_purchase(&purchase, now);
        let lines = reward_lines(
            &product.rewards,
            &format!("purchase_{}", product.product_id),
            "purchase",
        )?;
        let purchase_doc = schema::purchases(&player_id)?.doc(&record.transaction_id)?;
        let purchase_data = encode_document(&record)?;
        let price_cents = record.price_cents;

        let credits = self
            .inner
            .ledger
            .apply(&player_id, lines, move |profile, writes| {
                profile.monetization.record_purchase(price_cents);
                writes.push(WriteOperation::create(purchase_doc, purchase_data));
                Ok(())
            })
            .await
            .map_err(|err| match err.code {
                RunnerErrorCode::Conflict => duplicate_transaction(format!(
                    "transaction {} already recorded remotely",
                    purchase.transaction_id
                )),
                _ => err,
            })?;

        let mut history = self.history_of(&player_id);
        history.push(record.clone());
        self.sync()
            .store_cached(&keys::purchases(&player_id), &history, 0, None);

        self.sync().analytics().log_event(&MetricEvent::PurchaseCompleted {
            product_id: record.product_id.clone(),
            price_cents: record.price_cents,
            currency_code: record.currency_code.clone(),
        });
        self.inner.ledger.publish(MonetizationEvent::PurchaseCompleted {
            product_id: record.product_id.clone(),
            transaction_id: record.transaction_id.clone(),
        });

        let subscription = match product.kind {
            ProductKind::Subscription => Some(self.activate_subscription(&product)),
            ProductKind::Consumable => None,
        };
        Ok(PurchaseReceipt {
            record,
            credits,
            subscription,
        })
    }

    async fn ensure_new_transaction(
        &self,
        player_id: &str,
        purchase: &PurchaseSucceeded,
    ) -> RunnerResult<()> {
        let transaction_id = &purchase.transaction_id;
        if self
            .history_of(player_id)
            .iter()
            .any(|record| &record.transaction_id == transaction_id)
        {
            return Err(duplicate_transaction(format!(
                "transaction {transaction_id} already credited"
            )));
        }
        let path = schema::purchases(player_id)?.doc(transaction_id)?;
        if self.sync().queue().has_pending_for(&path) {
            return Err(duplicate_transaction(format!(
                "transaction {transaction_id} is waiting to sync"
            )));
        }
        match self.sync().remote_get(&path).await {
            Ok(snapshot) if snapshot.exists() => Err(duplicate_transaction(format!(
                "transaction {transaction_id} already recorded remotely"
            ))),
            Ok(_) => Ok(()),
            // The create precondition catches a remote duplicate once the write is replayed.
            Err(err) if err.is_retriable() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Forgets purchases whose queued credit the server refused. The balance itself was already
    /// rolled back with the refused batch.
    fn revert_purchases(&self, paths: &[String], reason: &str) {
        for path in paths {
            let Ok(path) = DocumentPath::from_string(path) else {
                continue;
            };
            let [users, player_id, purchases, transaction_id] = path.segments() else {
                continue;
            };
            if users != schema::USERS || purchases != schema::PURCHASES {
                continue;
            }
            let mut history = self.history_of(player_id);
            let before = history.len();
            history.retain(|record| &record.transaction_id != transaction_id);
            if history.len() == before {
                continue;
            }
            self.sync()
                .store_cached(&keys::purchases(player_id), &history, 0, None);
            LOGGER.warn(format!(
                "purchase {transaction_id} for {player_id} reverted: {reason}"
            ));
            self.inner.ledger.publish(MonetizationEvent::PurchaseReverted {
                transaction_id: transaction_id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    fn flag_product(&self, player_id: &str, product_id: &str) -> u32 {
        let mut flags = self.fraud_flags(player_id);
        let count = flags.entry(product_id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.sync()
            .store_cached(&keys::fraud_flags(player_id), &flags, 0, None);
        count
    }

    pub fn subscription(&self, product_id: &str) -> Option<SubscriptionState> {
        self.sync()
            .read_cached::<SubscriptionState>(&keys::subscription(product_id))
            .map(|blob| blob.value)
    }

    fn activate_subscription(&self, product: &ProductDefinition) -> SubscriptionState {
        let mut state = self
            .subscription(&product.product_id)
            .unwrap_or_else(|| SubscriptionState::new(product.product_id.clone()));
        let period = Duration::milliseconds(self.settings().subscription_period_millis as i64);
        let transition = state.purchase(self.sync().now(), period);
        LOGGER.info(format!("{} {:?}", product.product_id, transition));
        self.store_subscription(&state);
        state
    }

    fn store_subscription(&self, state: &SubscriptionState) {
        self.sync()
            .store_cached(&keys::subscription(&state.product_id), state, 0, None);
        self.sync()
            .analytics()
            .log_event(&MetricEvent::SubscriptionChanged {
                product_id: state.product_id.clone(),
                status: state.status.as_str().to_string(),
            });
        self.inner
            .ledger
            .publish(MonetizationEvent::SubscriptionChanged {
                product_id: state.product_id.clone(),
                status: state.status.as_str().to_string(),
            });
    }

    /// Periodic expiry check over every subscription product. Grants nothing.
    pub fn check_subscriptions(&self) -> Vec<(String, SubscriptionTransition)> {
        let now = self.sync().now();
        let grace = Duration::milliseconds(self.settings().subscription_grace_millis as i64);
        let mut transitions = Vec::new();
        for product in self.settings().subscription_products() {
            let Some(mut state) = self.subscription(&product.product_id) else {
                continue;
            };
            if let Some(transition) = state.check(now, grace) {
                self.store_subscription(&state);
                transitions.push((product.product_id.clone(), transition));
            }
        }
        transitions
    }

    /// Credits a completed rewarded ad, bounded per placement per UTC day.
    pub async fn reward_ad(&self, ad: &AdCompleted) -> RunnerResult<LedgerReceipt> {
        let player_id = self.current_player()?;
        if ad.placement.trim().is_empty() {
            return Err(invalid_input("ad placement is empty"));
        }
        let _guard = self.sync().lock_resource(&format!("ads:{player_id}")).await;
        let key = keys::ad_rewards(&player_id);
        let now = self.sync().now();
        let mut counters = self
            .sync()
            .read_cached::<AdCounters>(&key)
            .map(|blob| blob.value)
            .unwrap_or_default();
        let cap = self.settings().ad_daily_cap;
        if counters.views(&ad.placement, now) >= cap {
            return Err(limit_exceeded(format!(
                "{} rewarded ads already watched at {} today",
                cap, ad.placement
            )));
        }

        let receipt = self
            .inner
            .ledger
            .add_currency(ad.reward.currency, ad.reward.amount, &ad.source())
            .await?;
        counters.record(&ad.placement, now);
        self.sync().store_cached(&key, &counters, 0, None);
        self.sync().analytics().log_event(&MetricEvent::AdRewarded {
            placement: ad.placement.clone(),
            currency: ad.reward.currency.as_str().to_string(),
            amount: ad.reward.amount,
        });
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{Analytics, RecordingAnalyticsSink};
    use crate::cache::{InMemoryCacheStore, LocalCache};
    use crate::connectivity::ManualConnectivity;
    use crate::identity::StaticIdentityProvider;
    use crate::model::CurrencyType;
    use crate::monetization::purchase::StaticReceiptValidator;
    use crate::monetization::subscription::SubscriptionStatus;
    use crate::queue::{OperationQueue, QueueSettings};
    use crate::remote::InMemoryRemoteStore;
    use crate::sync::{SyncServices, SyncSettings};
    use crate::util::ManualClock;
    use chrono::{TimeZone, Utc};

    struct Harness {
        service: MonetizationService,
        clock: Arc<ManualClock>,
        remote: InMemoryRemoteStore,
        connectivity: ManualConnectivity,
        validator: StaticReceiptValidator,
        sink: Arc<RecordingAnalyticsSink>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap(),
        ));
        let cache = Arc::new(LocalCache::new(Arc::new(InMemoryCacheStore::new())));
        let queue = Arc::new(OperationQueue::open(
            Arc::clone(&cache),
            QueueSettings::default(),
        ));
        let remote = InMemoryRemoteStore::new(clock.clone());
        let connectivity = ManualConnectivity::new(true);
        let sink = Arc::new(RecordingAnalyticsSink::new());
        let sync = SyncEngine::new(
            SyncServices {
                cache,
                queue,
                remote: Arc::new(remote.clone()),
                connectivity: Arc::new(connectivity.clone()),
                clock: clock.clone(),
                analytics: Analytics::new(sink.clone()),
            },
            SyncSettings::default(),
        );
        let ledger = CurrencyLedger::new(
            sync,
            Arc::new(StaticIdentityProvider::signed_in("p1")),
            Arc::new(MonetizationSettings::default()),
        );
        let validator = StaticReceiptValidator::new();
        Harness {
            service: MonetizationService::new(ledger, Some(Arc::new(validator.clone()))),
            clock,
            remote,
            connectivity,
            validator,
            sink,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn replayed_purchase_is_not_credited_twice() {
        let h = harness();
        let purchase = PurchaseSucceeded::new("gems_small", "GPA.1", 199, "receipt-1");
        let receipt = h.service.complete_purchase(purchase.clone()).await.unwrap();
        assert_eq!(receipt.credits.balance(CurrencyType::Gems), Some(150));
        assert!(receipt.subscription.is_none());

        let err = h.service.complete_purchase(purchase).await.unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::DuplicateTransaction);
        assert_eq!(h.service.ledger().balance(CurrencyType::Gems).await.unwrap(), 150);

        let stored = h
            .remote
            .document(&schema::purchases("p1").unwrap().doc("GPA.1").unwrap())
            .unwrap();
        assert_eq!(stored["productId"], "gems_small");
        assert_ne!(stored["receiptFingerprint"], "receipt-1");
        let user = h.remote.document(&schema::user("p1").unwrap()).unwrap();
        assert_eq!(user["monetization"]["purchaseCount"], 1);
        assert_eq!(user["monetization"]["totalSpentCents"], 199);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn remote_record_blocks_replay_from_another_device() {
        let h = harness();
        h.service
            .complete_purchase(PurchaseSucceeded::new("gems_small", "GPA.2", 199, "r"))
            .await
            .unwrap();
        h.service
            .sync()
            .purge_player_cache("p1");

        let err = h
            .service
            .complete_purchase(PurchaseSucceeded::new("gems_small", "GPA.2", 199, "r"))
            .await
            .unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::DuplicateTransaction);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn starter_bundle_credits_every_currency() {
        let h = harness();
        let receipt = h
            .service
            .complete_purchase(PurchaseSucceeded::new("starter_bundle", "GPA.3", 499, "r"))
            .await
            .unwrap();
        assert_eq!(receipt.credits.transactions.len(), 3);
        assert!(receipt
            .credits
            .transactions
            .iter()
            .all(|tx| tx.source == "purchase_starter_bundle"));
        let balances = h.service.ledger().balances().await.unwrap();
        assert_eq!(balances.get(CurrencyType::Coins), 6_000);
        assert_eq!(balances.get(CurrencyType::Energy), 150);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejected_receipts_flag_the_product() {
        let h = harness();
        h.validator.reject_receipt("forged");
        for n in 0..3 {
            let err = h
                .service
                .complete_purchase(PurchaseSucceeded::new(
                    "gems_large",
                    format!("bad-{n}"),
                    999,
                    "forged",
                ))
                .await
                .unwrap_err();
            assert_eq!(err.code, RunnerErrorCode::InvalidInput);
        }
        assert_eq!(h.service.ledger().balance(CurrencyType::Gems).await.unwrap(), 50);
        assert_eq!(
            h.service.check_purchase_allowed("gems_large").unwrap(),
            PurchaseDecision::Declined {
                reason: DeclineReason::SuspiciousActivity { flags: 3 }
            }
        );
        assert!(h.service.check_purchase_allowed("gems_small").unwrap().is_allowed());
        assert!(!h.sink.named("purchase_declined").is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_products_are_declined_softly() {
        let h = harness();
        assert_eq!(
            h.service.check_purchase_allowed("gold_bars").unwrap(),
            PurchaseDecision::Declined {
                reason: DeclineReason::UnknownProduct
            }
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn subscription_rewards_follow_purchases_only() {
        let h = harness();
        let first = h
            .service
            .complete_purchase(PurchaseSucceeded::new("vip_monthly", "sub-1", 799, "r1"))
            .await
            .unwrap();
        assert_eq!(
            first.subscription.as_ref().map(|s| s.status),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(first.credits.balance(CurrencyType::Tickets), Some(5));

        h.clock.advance(Duration::days(31));
        let transitions = h.service.check_subscriptions();
        assert_eq!(
            transitions,
            vec![("vip_monthly".to_string(), SubscriptionTransition::Expired)]
        );
        assert!(h.service.check_subscriptions().is_empty());
        assert_eq!(h.service.ledger().balance(CurrencyType::Tickets).await.unwrap(), 5);

        h.clock.advance(Duration::days(3));
        let transitions = h.service.check_subscriptions();
        assert_eq!(transitions[0].1, SubscriptionTransition::Deactivated);
        let state = h.service.subscription("vip_monthly").unwrap();
        assert_eq!(state.status, SubscriptionStatus::Inactive);
        assert!(!state.will_renew);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ad_rewards_stop_at_the_daily_cap() {
        let h = harness();
        let ad = AdCompleted::new("revive", CurrencyType::Coins, 25);
        for _ in 0..10 {
            h.service.reward_ad(&ad).await.unwrap();
        }
        let err = h.service.reward_ad(&ad).await.unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::LimitExceeded);
        assert_eq!(h.service.ledger().balance(CurrencyType::Coins).await.unwrap(), 1_250);
        let rows = h.service.ledger().cached_transactions(CurrencyType::Coins);
        assert!(rows.iter().all(|row| row.source == "ad_revive"));

        h.clock.advance(Duration::days(1));
        h.service.reward_ad(&ad).await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn offline_purchase_is_queued_and_credited() {
        let h = harness();
        h.service.ledger().balances().await.unwrap();
        h.connectivity.set_online(false);
        let receipt = h
            .service
            .complete_purchase(PurchaseSucceeded::new("gems_small", "GPA.9", 199, "r"))
            .await
            .unwrap();
        assert!(receipt.credits.outcome.is_queued());
        assert_eq!(h.service.ledger().balance(CurrencyType::Gems).await.unwrap(), 150);

        let err = h
            .service
            .complete_purchase(PurchaseSucceeded::new("gems_small", "GPA.9", 199, "r"))
            .await
            .unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::DuplicateTransaction);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn offline_replay_of_redeemed_order_is_reverted() {
        let h = harness();
        h.service.ledger().balances().await.unwrap();
        // The order was redeemed on another device.
        h.remote.seed(
            schema::purchases("p1").unwrap().doc("GPA.7").unwrap(),
            crate::remote::DocumentData::new(),
        );

        let reverted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reverted);
        let _subscription = h.service.ledger().subscribe(move |event| {
            if let MonetizationEvent::PurchaseReverted { transaction_id, .. } = event {
                sink.lock().unwrap().push(transaction_id.clone());
            }
        });

        h.connectivity.set_online(false);
        let receipt = h
            .service
            .complete_purchase(PurchaseSucceeded::new("gems_small", "GPA.7", 199, "r"))
            .await
            .unwrap();
        assert!(receipt.credits.outcome.is_queued());
        assert_eq!(h.service.ledger().balance(CurrencyType::Gems).await.unwrap(), 150);

        h.connectivity.set_online(true);
        let report = h.service.sync().drain_queue().await;
        assert_eq!(report.rejected, 1);

        assert_eq!(*reverted.lock().unwrap(), vec!["GPA.7".to_string()]);
        assert!(h.service.purchase_history().unwrap().is_empty());
        assert!(h.service.ledger().cached_transactions(CurrencyType::Gems).is_empty());
        assert_eq!(h.service.ledger().balance(CurrencyType::Gems).await.unwrap(), 50);
        let user = h.remote.document(&schema::user("p1").unwrap()).unwrap();
        assert_eq!(user["currencies"]["gems"], 50);
        assert_eq!(user["monetization"]["purchaseCount"], 0);
    }
}

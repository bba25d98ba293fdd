use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::MetricEvent;
use crate::cache::keys;
use crate::error::{
    insufficient_funds, invalid_input, limit_exceeded, RunnerResult,
};
use crate::identity::{require_user, IdentityArc};
use crate::logger::Logger;
use crate::model::{CurrencyBalances, CurrencyType, PlayerProfile};
use crate::monetization::config::MonetizationSettings;
use crate::remote::{encode_document, schema, DocumentQuery, FilterOperator, WriteOperation};
use crate::queue::OperationQueue;
use crate::sync::{SyncEngine, SyncEvent, WriteOutcome};
use crate::util::{next_id, EventBus, Subscription};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@runner/monetization"));

/// Immutable ledger row. Positive amounts are credits, negative amounts debits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyTransaction {
    pub transaction_id: String,
    pub player_id: String,
    pub currency: CurrencyType,
    pub amount: i64,
    pub balance_after: i64,
    pub source: String,
    #[serde(default)]
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LedgerReceipt {
    pub transactions: Vec<CurrencyTransaction>,
    pub outcome: WriteOutcome,
}

impl LedgerReceipt {
    /// Balance after the last row for `currency` in this receipt.
    pub fn balance(&self, currency: CurrencyType) -> Option<i64> {
        self.transactions
            .iter()
            .rev()
            .find(|tx| tx.currency == currency)
            .map(|tx| tx.balance_after)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileSource {
    Remote,
    /// The ledger sum last confirmed remotely plus rows recorded on this device since.
    Cache,
}

/// What the device knows of one currency's ledger: the newest rows, and the sum of the older
/// rows that were folded away. `base_sum` plus the rows is the ledger total.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LedgerTail {
    base_sum: i64,
    rows: Vec<CurrencyTransaction>,
}

impl LedgerTail {
    fn rows_sum(&self) -> i64 {
        self.rows.iter().map(|row| row.amount).sum()
    }

    fn total(&self) -> i64 {
        self.base_sum.saturating_add(self.rows_sum())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciliation {
    pub currency: CurrencyType,
    pub balance: i64,
    pub opening_balance: i64,
    pub ledger_sum: i64,
    pub source: ReconcileSource,
}

impl Reconciliation {
    /// Balance minus what the ledger accounts for. Zero when consistent.
    pub fn discrepancy(&self) -> i64 {
        self.balance - (self.opening_balance + self.ledger_sum)
    }

    pub fn is_consistent(&self) -> bool {
        self.discrepancy() == 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MonetizationEvent {
    BalanceChanged {
        currency: CurrencyType,
        balance: i64,
        delta: i64,
    },
    PurchaseCompleted {
        product_id: String,
        transaction_id: String,
    },
    PurchaseDeclined {
        product_id: String,
        reason: String,
    },
    SubscriptionChanged {
        product_id: String,
        status: String,
    },
    /// A purchase credited while offline was refused when it reached the server, usually
    /// because another device had already redeemed the transaction. Its credit was rolled back.
    PurchaseReverted {
        transaction_id: String,
        reason: String,
    },
}

/// One requested balance movement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LedgerLine {
    pub currency: CurrencyType,
    pub amount: i64,
    pub source: String,
    pub reason: String,
}

/// Currency balances and their transaction ledger.
///
/// Every movement is one profile read-modify-write: balance checks, the balance update and the
/// ledger rows are applied together under the profile lock and written as one batch. Movements
/// queued offline replay as deltas on whatever balance the server holds by then, and a batch the
/// server refuses takes its ledger rows with it.
#[derive(Clone)]
pub struct CurrencyLedger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    sync: SyncEngine,
    identity: IdentityArc,
    settings: Arc<MonetizationSettings>,
    events: EventBus<MonetizationEvent>,
    rejections: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for CurrencyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrencyLedger")
            .field("caps", &self.inner.settings.currency_caps)
            .finish()
    }
}

impl CurrencyLedger {
    pub fn new(
        sync: SyncEngine,
        identity: IdentityArc,
        settings: Arc<MonetizationSettings>,
    ) -> Self {
        let ledger = Self {
            inner: Arc::new(LedgerInner {
                sync,
                identity,
                settings,
                events: EventBus::new(),
                rejections: Mutex::new(None),
            }),
        };
        let weak = Arc::downgrade(&ledger.inner);
        let subscription = ledger.inner.sync.subscribe(move |event| {
            if let SyncEvent::WriteRejected { paths, .. } = event {
                if let Some(inner) = weak.upgrade() {
                    CurrencyLedger { inner }.forget_rejected(paths);
                }
            }
        });
        *ledger.inner.rejections.lock().unwrap() = Some(subscription);
        ledger
    }

    pub(crate) fn sync(&self) -> &SyncEngine {
        &self.inner.sync
    }

    pub(crate) fn identity(&self) -> &IdentityArc {
        &self.inner.identity
    }

    pub fn settings(&self) -> &MonetizationSettings {
        &self.inner.settings
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&MonetizationEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn events(&self) -> async_channel::Receiver<MonetizationEvent> {
        self.inner.events.channel()
    }

    pub(crate) fn publish(&self, event: MonetizationEvent) {
        self.inner.events.publish(event);
    }

    pub async fn add_currency(
        &self,
        currency: CurrencyType,
        amount: i64,
        source: &str,
    ) -> RunnerResult<LedgerReceipt> {
        if amount <= 0 {
            return Err(invalid_input(format!("credit must be positive, got {amount}")));
        }
        let player_id = require_user(self.inner.identity.as_ref())?;
        self.apply(&player_id, vec![line(currency, amount, source, "credit")?], |_, _| Ok(()))
            .await
    }

    pub async fn spend_currency(
        &self,
        currency: CurrencyType,
        amount: i64,
        purpose: &str,
    ) -> RunnerResult<LedgerReceipt> {
        if amount <= 0 {
            return Err(invalid_input(format!("spend must be positive, got {amount}")));
        }
        let player_id = require_user(self.inner.identity.as_ref())?;
        self.apply(&player_id, vec![line(currency, -amount, purpose, "spend")?], |_, _| Ok(()))
            .await
    }

    /// Credits several currencies at once; if any would pass its cap, none are credited.
    pub async fn add_currencies(
        &self,
        rewards: &CurrencyBalances,
        source: &str,
    ) -> RunnerResult<LedgerReceipt> {
        let player_id = require_user(self.inner.identity.as_ref())?;
        let lines = reward_lines(rewards, source, "credit")?;
        if lines.is_empty() {
            return Err(invalid_input("nothing to credit"));
        }
        self.apply(&player_id, lines, |_, _| Ok(())).await
    }

    pub async fn balance(&self, currency: CurrencyType) -> RunnerResult<i64> {
        Ok(self.balances().await?.get(currency))
    }

    pub async fn balances(&self) -> RunnerResult<CurrencyBalances> {
        let player_id = require_user(self.inner.identity.as_ref())?;
        let profile = match self.inner.sync.cached_profile(&player_id) {
            Some(profile) => profile,
            None => self.inner.sync.load_profile(&player_id).await?.value,
        };
        Ok(profile.currencies)
    }

    /// Recent rows recorded on this device for `currency`, oldest first. Rows still waiting to
    /// sync are always included.
    pub fn cached_transactions(&self, currency: CurrencyType) -> Vec<CurrencyTransaction> {
        self.tail(currency).rows
    }

    fn tail(&self, currency: CurrencyType) -> LedgerTail {
        self.inner
            .sync
            .read_cached::<LedgerTail>(&keys::currency(currency.as_str()))
            .map(|blob| blob.value)
            .unwrap_or_default()
    }

    fn store_tail(&self, currency: CurrencyType, tail: &LedgerTail) {
        self.inner
            .sync
            .store_cached(&keys::currency(currency.as_str()), tail, 0, None);
    }

    /// Folds the oldest synced rows into `base_sum` until at most `ledger_cache_window` rows
    /// remain. Rows still in the queue are never folded.
    fn fold_synced(&self, tail: &mut LedgerTail) {
        let window = self.inner.settings.ledger_cache_window;
        let queue = self.inner.sync.queue();
        while tail.rows.len() > window {
            let Some(index) = tail.rows.iter().position(|row| !is_pending(queue, row)) else {
                break;
            };
            let folded = tail.rows.remove(index);
            tail.base_sum = tail.base_sum.saturating_add(folded.amount);
        }
    }

    fn forget_rejected(&self, paths: &[String]) {
        let prefix = format!("{}/", schema::CURRENCY_TRANSACTIONS);
        let rejected: HashSet<&str> = paths
            .iter()
            .filter_map(|path| path.strip_prefix(prefix.as_str()))
            .collect();
        if rejected.is_empty() {
            return;
        }
        for currency in CurrencyType::ALL {
            let mut tail = self.tail(currency);
            let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut tail.rows)
                .into_iter()
                .partition(|row| rejected.contains(row.transaction_id.as_str()));
            tail.rows = kept;
            let Some(first) = dropped.first() else {
                continue;
            };
            self.store_tail(currency, &tail);

            let delta: i64 = -dropped.iter().map(|row| row.amount).sum::<i64>();
            LOGGER.warn(format!(
                "{} {currency} ledger rows refused by the server; {delta} rolled back",
                dropped.len()
            ));
            if let Some(profile) = self.inner.sync.cached_profile(&first.player_id) {
                self.publish(MonetizationEvent::BalanceChanged {
                    currency,
                    balance: profile.currencies.get(currency),
                    delta,
                });
            }
        }
    }

    /// Compares balances with the starting balance plus the ledger. Never blocks gameplay: a
    /// discrepancy is reported and logged, not corrected.
    pub async fn reconcile(&self) -> RunnerResult<Vec<Reconciliation>> {
        let player_id = require_user(self.inner.identity.as_ref())?;
        let balances = self.balances().await?;
        let opening = &self.inner.sync.settings().starting_balances;

        let query = DocumentQuery::new(schema::currency_transactions()?).where_field(
            "playerId",
            FilterOperator::Equal,
            player_id.as_str(),
        );
        let (sums, source) = match self.inner.sync.remote_query(&query).await {
            Ok(snapshots) => {
                let mut sums: BTreeMap<CurrencyType, i64> = BTreeMap::new();
                let mut remote_ids = HashSet::new();
                for snapshot in snapshots {
                    if let Some(row) = snapshot.decode::<CurrencyTransaction>()? {
                        if row.player_id == player_id {
                            *sums.entry(row.currency).or_default() += row.amount;
                        }
                        remote_ids.insert(row.transaction_id);
                    }
                }
                for currency in CurrencyType::ALL {
                    let mut tail = self.tail(currency);
                    // Queued rows are already reflected in the balance.
                    let unsynced: i64 = tail
                        .rows
                        .iter()
                        .filter(|row| !remote_ids.contains(&row.transaction_id))
                        .map(|row| row.amount)
                        .sum();
                    let total = sums.entry(currency).or_default();
                    *total += unsynced;
                    let base_sum = *total - tail.rows_sum();
                    if tail.base_sum != base_sum {
                        tail.base_sum = base_sum;
                        self.store_tail(currency, &tail);
                    }
                }
                (sums, ReconcileSource::Remote)
            }
            Err(err) if err.is_retriable() => {
                let sums = CurrencyType::ALL
                    .into_iter()
                    .map(|currency| (currency, self.tail(currency).total()))
                    .collect();
                (sums, ReconcileSource::Cache)
            }
            Err(err) => return Err(err),
        };

        let report: Vec<Reconciliation> = CurrencyType::ALL
            .into_iter()
            .map(|currency| Reconciliation {
                currency,
                balance: balances.get(currency),
                opening_balance: opening.get(currency),
                ledger_sum: sums.get(&currency).copied().unwrap_or(0),
                source,
            })
            .collect();
        for item in report.iter().filter(|item| !item.is_consistent()) {
            LOGGER.warn(format!(
                "{} ledger off by {} for {player_id} ({:?})",
                item.currency,
                item.discrepancy(),
                item.source
            ));
        }
        Ok(report)
    }

    /// Applies `lines` and `also` to the player's profile in one read-modify-write.
    ///
    /// Validation happens before anything is written: a line that would pass a cap or overdraw a
    /// balance rejects the whole batch.
    pub(crate) async fn apply<F>(
        &self,
        player_id: &str,
        lines: Vec<LedgerLine>,
        also: F,
    ) -> RunnerResult<LedgerReceipt>
    where
        F: FnOnce(&mut PlayerProfile, &mut Vec<WriteOperation>) -> RunnerResult<()> + Send,
    {
        let settings = Arc::clone(&self.inner.settings);
        let now = self.inner.sync.now();
        let now_millis = self.inner.sync.clock().now_millis();

        let mutation = self
            .inner
            .sync
            .update_profile_with(player_id, move |profile, writes| {
                let mut transactions = Vec::with_capacity(lines.len());
                for line in lines {
                    let current = profile.currencies.get(line.currency);
                    let next = current.checked_add(line.amount).ok_or_else(|| {
                        limit_exceeded(format!("{} balance would overflow", line.currency))
                    })?;
                    if line.amount > 0 {
                        if let Some(cap) = settings.cap(line.currency) {
                            if next > cap {
                                return Err(limit_exceeded(format!(
                                    "{} would reach {next}, above the cap of {cap}",
                                    line.currency
                                )));
                            }
                        }
                    } else if next < 0 {
                        return Err(insufficient_funds(format!(
                            "need {} {}, have {current}",
                            -line.amount, line.currency
                        )));
                    }

                    let balance_after = profile.currencies.apply(line.currency, line.amount);
                    let transaction = CurrencyTransaction {
                        transaction_id: next_id(now_millis),
                        player_id: profile.player_id.clone(),
                        currency: line.currency,
                        amount: line.amount,
                        balance_after,
                        source: line.source,
                        reason: line.reason,
                        timestamp: now,
                    };
                    writes.push(WriteOperation::create(
                        schema::currency_transaction(&transaction.transaction_id)?,
                        encode_document(&transaction)?,
                    ));
                    transactions.push(transaction);
                }
                also(profile, writes)?;
                Ok(transactions)
            })
            .await?;

        for transaction in &mutation.value {
            self.record(transaction);
        }
        Ok(LedgerReceipt {
            transactions: mutation.value,
            outcome: mutation.outcome,
        })
    }

    fn record(&self, transaction: &CurrencyTransaction) {
        let mut tail = self.tail(transaction.currency);
        tail.rows.push(transaction.clone());
        self.fold_synced(&mut tail);
        self.store_tail(transaction.currency, &tail);

        let currency = transaction.currency.as_str().to_string();
        let event = if transaction.amount > 0 {
            MetricEvent::CurrencyEarned {
                currency,
                amount: transaction.amount,
                source: transaction.source.clone(),
            }
        } else {
            MetricEvent::CurrencySpent {
                currency,
                amount: -transaction.amount,
                purpose: transaction.source.clone(),
            }
        };
        self.inner.sync.analytics().log_event(&event);
        self.publish(MonetizationEvent::BalanceChanged {
            currency: transaction.currency,
            balance: transaction.balance_after,
            delta: transaction.amount,
        });
    }
}

fn line(currency: CurrencyType, amount: i64, source: &str, reason: &str) -> RunnerResult<LedgerLine> {
    if source.trim().is_empty() {
        return Err(invalid_input("ledger rows need a source"));
    }
    Ok(LedgerLine {
        currency,
        amount,
        source: source.to_string(),
        reason: reason.to_string(),
    })
}

fn is_pending(queue: &OperationQueue, row: &CurrencyTransaction) -> bool {
    schema::currency_transaction(&row.transaction_id)
        .map_or(false, |path| queue.has_pending_for(&path))
}

/// One credit line per positive entry of `rewards`.
pub(crate) fn reward_lines(
    rewards: &CurrencyBalances,
    source: &str,
    reason: &str,
) -> RunnerResult<Vec<LedgerLine>> {
    rewards
        .iter()
        .filter(|(_, amount)| *amount > 0)
        .map(|(currency, amount)| line(currency, amount, source, reason))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::Analytics;
    use crate::cache::{InMemoryCacheStore, LocalCache};
    use crate::connectivity::ManualConnectivity;
    use crate::error::RunnerErrorCode;
    use crate::identity::StaticIdentityProvider;
    use crate::queue::{OperationQueue, QueueSettings};
    use crate::remote::InMemoryRemoteStore;
    use crate::sync::{SyncServices, SyncSettings};
    use crate::util::ManualClock;
    use chrono::TimeZone;

    fn ledger(online: bool) -> (CurrencyLedger, ManualConnectivity) {
        ledger_with(online, MonetizationSettings::default())
    }

    fn ledger_with(
        online: bool,
        settings: MonetizationSettings,
    ) -> (CurrencyLedger, ManualConnectivity) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 10, 8, 0, 0).unwrap(),
        ));
        let cache = Arc::new(LocalCache::new(Arc::new(InMemoryCacheStore::new())));
        let queue = Arc::new(OperationQueue::open(
            Arc::clone(&cache),
            QueueSettings::default(),
        ));
        let connectivity = ManualConnectivity::new(online);
        let sync = SyncEngine::new(
            SyncServices {
                cache,
                queue,
                remote: Arc::new(InMemoryRemoteStore::new(clock.clone())),
                connectivity: Arc::new(connectivity.clone()),
                clock,
                analytics: Analytics::default(),
            },
            SyncSettings::default(),
        );
        let ledger = CurrencyLedger::new(
            sync,
            Arc::new(StaticIdentityProvider::signed_in("p1")),
            Arc::new(settings),
        );
        (ledger, connectivity)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn spend_never_overdraws() {
        let (ledger, _) = ledger(true);
        let err = ledger
            .spend_currency(CurrencyType::Gems, 51, "skin")
            .await
            .unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::InsufficientFunds);
        assert_eq!(ledger.balance(CurrencyType::Gems).await.unwrap(), 50);

        let receipt = ledger
            .spend_currency(CurrencyType::Gems, 50, "skin")
            .await
            .unwrap();
        assert_eq!(receipt.balance(CurrencyType::Gems), Some(0));
        assert_eq!(receipt.outcome, WriteOutcome::Committed);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn credit_respects_cap_and_sign() {
        let (ledger, _) = ledger(true);
        let err = ledger
            .add_currency(CurrencyType::Energy, 901, "refill")
            .await
            .unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::LimitExceeded);
        ledger
            .add_currency(CurrencyType::Energy, 900, "refill")
            .await
            .unwrap();
        assert_eq!(ledger.balance(CurrencyType::Energy).await.unwrap(), 1_000);

        for amount in [0, -5] {
            let err = ledger
                .add_currency(CurrencyType::Coins, amount, "bonus")
                .await
                .unwrap_err();
            assert_eq!(err.code, RunnerErrorCode::InvalidInput);
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn multi_currency_credit_is_all_or_nothing() {
        let (ledger, _) = ledger(true);
        let rewards = CurrencyBalances::new()
            .with(CurrencyType::Coins, 10)
            .with(CurrencyType::Tickets, 1_000);
        let err = ledger.add_currencies(&rewards, "event").await.unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::LimitExceeded);
        assert_eq!(ledger.balance(CurrencyType::Coins).await.unwrap(), 1_000);
        assert!(ledger.cached_transactions(CurrencyType::Coins).is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ledger_reconciles_online_and_offline() {
        let (ledger, connectivity) = ledger(true);
        ledger
            .add_currency(CurrencyType::Coins, 250, "race_reward")
            .await
            .unwrap();
        connectivity.set_online(false);
        let receipt = ledger
            .spend_currency(CurrencyType::Coins, 100, "upgrade")
            .await
            .unwrap();
        assert!(receipt.outcome.is_queued());

        let report = ledger.reconcile().await.unwrap();
        let coins = report
            .iter()
            .find(|item| item.currency == CurrencyType::Coins)
            .unwrap();
        assert_eq!(coins.source, ReconcileSource::Cache);
        assert_eq!(coins.balance, 1_150);
        assert!(coins.is_consistent());

        connectivity.set_online(true);
        let report = ledger.reconcile().await.unwrap();
        assert!(report.iter().all(Reconciliation::is_consistent));
        assert!(report.iter().all(|item| item.source == ReconcileSource::Remote));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cached_rows_stay_within_the_window() {
        let settings = MonetizationSettings {
            ledger_cache_window: 3,
            ..MonetizationSettings::default()
        };
        let (ledger, connectivity) = ledger_with(true, settings);
        for _ in 0..5 {
            ledger
                .add_currency(CurrencyType::Coins, 10, "race_reward")
                .await
                .unwrap();
        }
        assert_eq!(ledger.cached_transactions(CurrencyType::Coins).len(), 3);

        // Rows waiting to sync are never folded away.
        connectivity.set_online(false);
        for _ in 0..5 {
            ledger
                .spend_currency(CurrencyType::Coins, 1, "upgrade")
                .await
                .unwrap();
        }
        let rows = ledger.cached_transactions(CurrencyType::Coins);
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|row| row.amount == -1));

        let report = ledger.reconcile().await.unwrap();
        let coins = report
            .iter()
            .find(|item| item.currency == CurrencyType::Coins)
            .unwrap();
        assert_eq!(coins.source, ReconcileSource::Cache);
        assert_eq!(coins.ledger_sum, 45);
        assert!(coins.is_consistent());

        connectivity.set_online(true);
        ledger.sync().drain_queue().await;
        let report = ledger.reconcile().await.unwrap();
        assert!(report.iter().all(Reconciliation::is_consistent));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn refused_rows_leave_the_cache() {
        let (ledger, connectivity) = ledger(true);
        ledger.balances().await.unwrap();
        connectivity.set_online(false);
        let receipt = ledger
            .spend_currency(CurrencyType::Coins, 100, "upgrade")
            .await
            .unwrap();
        let refused = &receipt.transactions[0];

        let deltas = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&deltas);
        let _subscription = ledger.subscribe(move |event| {
            if let MonetizationEvent::BalanceChanged { delta, .. } = event {
                sink.lock().unwrap().push(*delta);
            }
        });
        ledger.sync().publish(SyncEvent::WriteRejected {
            paths: vec![
                "users/p1".to_string(),
                format!("currency_transactions/{}", refused.transaction_id),
            ],
            reason: "precondition failed".to_string(),
        });

        assert!(ledger.cached_transactions(CurrencyType::Coins).is_empty());
        assert_eq!(*deltas.lock().unwrap(), vec![100]);
    }
}

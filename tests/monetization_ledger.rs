use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use runner_sync::analytics::{Analytics, RecordingAnalyticsSink};
use runner_sync::app::{RunnerApp, RunnerSettings};
use runner_sync::connectivity::ManualConnectivity;
use runner_sync::error::RunnerErrorCode;
use runner_sync::identity::StaticIdentityProvider;
use runner_sync::model::CurrencyType;
use runner_sync::monetization::{
    AdCompleted, DeclineReason, MonetizationEvent, PurchaseDecision, PurchaseSucceeded,
    StaticReceiptValidator, SubscriptionStatus,
};
use runner_sync::remote::{schema, InMemoryRemoteStore};
use runner_sync::util::ManualClock;

struct Wallet {
    app: RunnerApp,
    clock: Arc<ManualClock>,
    remote: InMemoryRemoteStore,
    connectivity: ManualConnectivity,
    sink: Arc<RecordingAnalyticsSink>,
}

fn wallet(settings: RunnerSettings) -> Wallet {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 11, 2, 9, 30, 0).unwrap(),
    ));
    let remote = InMemoryRemoteStore::new(clock.clone());
    wallet_on(settings, clock, remote)
}

/// Another device signed in to the same account against the same backend.
fn wallet_on(
    settings: RunnerSettings,
    clock: Arc<ManualClock>,
    remote: InMemoryRemoteStore,
) -> Wallet {
    let connectivity = ManualConnectivity::new(true);
    let sink = Arc::new(RecordingAnalyticsSink::new());
    let app = RunnerApp::builder()
        .settings(settings)
        .remote(Arc::new(remote.clone()))
        .clock(clock.clone())
        .connectivity(Arc::new(connectivity.clone()))
        .identity(Arc::new(StaticIdentityProvider::signed_in("kai")))
        .analytics(Analytics::new(sink.clone()))
        .receipt_validator(Arc::new(StaticReceiptValidator::new()))
        .build()
        .unwrap();
    Wallet {
        app,
        clock,
        remote,
        connectivity,
        sink,
    }
}

#[tokio::test(flavor = "current_thread")]
async fn balances_always_match_the_ledger() {
    let w = wallet(RunnerSettings::default());
    let ledger = w.app.ledger();

    let moves: [(CurrencyType, i64); 8] = [
        (CurrencyType::Coins, 300),
        (CurrencyType::Coins, -1_250),
        (CurrencyType::Gems, -20),
        (CurrencyType::Energy, -100),
        (CurrencyType::Coins, -2_000),
        (CurrencyType::Energy, 40),
        (CurrencyType::Gems, 5),
        (CurrencyType::Tickets, 3),
    ];
    for (step, (currency, amount)) in moves.into_iter().enumerate() {
        if step == 4 {
            w.connectivity.set_online(false);
        }
        let before = ledger.balance(currency).await.unwrap();
        let result = if amount > 0 {
            ledger.add_currency(currency, amount, "quest").await
        } else {
            ledger.spend_currency(currency, -amount, "shop").await
        };
        match result {
            Ok(receipt) => assert_eq!(receipt.balance(currency), Some(before + amount)),
            Err(err) => {
                // Only the overdraft is refused.
                assert_eq!(err.code, RunnerErrorCode::InsufficientFunds);
                assert!(before < -amount);
                assert_eq!(ledger.balance(currency).await.unwrap(), before);
            }
        }
    }

    let report = ledger.reconcile().await.unwrap();
    assert!(report.iter().all(|item| item.is_consistent()), "{report:?}");
    let coins = report
        .iter()
        .find(|item| item.currency == CurrencyType::Coins)
        .unwrap();
    assert_eq!(coins.balance, 50);

    w.connectivity.set_online(true);
    w.app.sync().drain_queue().await;
    let report = ledger.reconcile().await.unwrap();
    assert!(report.iter().all(|item| item.is_consistent()));
    let stored = w.remote.document(&schema::user("kai").unwrap()).unwrap();
    assert_eq!(stored["currencies"]["energy"], 40);
    assert_eq!(stored["currencies"]["tickets"], 3);
}

#[tokio::test(flavor = "current_thread")]
async fn caps_bound_every_credit() {
    let mut settings = RunnerSettings::default();
    settings
        .monetization
        .currency_caps
        .insert(CurrencyType::Gems, 500);
    let w = wallet(settings);
    let ledger = w.app.ledger();

    ledger.add_currency(CurrencyType::Gems, 450, "event").await.unwrap();
    let err = ledger
        .add_currency(CurrencyType::Gems, 1, "event")
        .await
        .unwrap_err();
    assert_eq!(err.code, RunnerErrorCode::LimitExceeded);
    assert_eq!(ledger.balance(CurrencyType::Gems).await.unwrap(), 500);

    // A purchase that would overflow the cap credits nothing at all.
    let err = w
        .app
        .monetization()
        .complete_purchase(PurchaseSucceeded::new("gems_small", "order-1", 199, "r"))
        .await
        .unwrap_err();
    assert_eq!(err.code, RunnerErrorCode::LimitExceeded);
    assert!(w.app.monetization().purchase_history().unwrap().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn store_callback_replays_do_not_double_credit() {
    let w = wallet(RunnerSettings::default());
    let events = w.app.ledger().events();
    let purchase = PurchaseSucceeded::new("gems_large", "order-42", 999, "receipt");

    let receipt = w
        .app
        .monetization()
        .complete_purchase(purchase.clone())
        .await
        .unwrap();
    assert_eq!(receipt.credits.transactions[0].source, "purchase_gems_large");
    for _ in 0..2 {
        let err = w
            .app
            .monetization()
            .complete_purchase(purchase.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::DuplicateTransaction);
    }
    assert_eq!(w.app.ledger().balance(CurrencyType::Gems).await.unwrap(), 650);

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MonetizationEvent::PurchaseCompleted { .. }) {
            completed += 1;
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(w.sink.named("purchase_completed").len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn velocity_gates_decline_softly() {
    let mut settings = RunnerSettings::default();
    settings.monetization.hourly_product_cap = 2;
    settings.monetization.daily_spend_limit_cents = 2_500;
    let w = wallet(settings);
    let shop = w.app.monetization();

    for n in 0..2 {
        assert!(shop.check_purchase_allowed("gems_small").unwrap().is_allowed());
        shop.complete_purchase(PurchaseSucceeded::new(
            "gems_small",
            format!("hourly-{n}"),
            199,
            "r",
        ))
        .await
        .unwrap();
    }
    assert!(matches!(
        shop.check_purchase_allowed("gems_small").unwrap(),
        PurchaseDecision::Declined {
            reason: DeclineReason::HourlyProductCap { .. }
        }
    ));

    w.clock.advance(Duration::minutes(61));
    assert!(shop.check_purchase_allowed("gems_small").unwrap().is_allowed());

    shop.complete_purchase(PurchaseSucceeded::new("gems_large", "big-1", 999, "r"))
        .await
        .unwrap();
    shop.complete_purchase(PurchaseSucceeded::new("gems_large", "big-2", 999, "r"))
        .await
        .unwrap();
    assert!(matches!(
        shop.check_purchase_allowed("gems_small").unwrap(),
        PurchaseDecision::Declined {
            reason: DeclineReason::DailySpendLimit { .. }
        }
    ));
    assert_eq!(w.sink.named("purchase_declined").len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn subscription_grants_once_per_period() {
    let w = wallet(RunnerSettings::default());
    let shop = w.app.monetization();

    shop.complete_purchase(PurchaseSucceeded::new("vip_monthly", "vip-1", 799, "r"))
        .await
        .unwrap();
    for _ in 0..5 {
        w.clock.advance(Duration::days(5));
        shop.check_subscriptions();
    }
    assert_eq!(w.app.ledger().balance(CurrencyType::Gems).await.unwrap(), 350);
    assert_eq!(
        shop.subscription("vip_monthly").unwrap().status,
        SubscriptionStatus::Active
    );

    let renewal = shop
        .complete_purchase(PurchaseSucceeded::new("vip_monthly", "vip-2", 799, "r"))
        .await
        .unwrap();
    let state = renewal.subscription.unwrap();
    assert_eq!(state.renewals, 1);
    assert_eq!(w.app.ledger().balance(CurrencyType::Gems).await.unwrap(), 650);

    w.clock.advance(Duration::days(40));
    shop.check_subscriptions();
    let state = shop.subscription("vip_monthly").unwrap();
    assert_eq!(state.status, SubscriptionStatus::Expired);
    assert!(!state.will_renew);
    assert_eq!(w.app.ledger().balance(CurrencyType::Gems).await.unwrap(), 650);
}

#[tokio::test(flavor = "current_thread")]
async fn rewarded_ads_credit_with_a_placement_source() {
    let mut settings = RunnerSettings::default();
    settings.monetization.ad_daily_cap = 2;
    let w = wallet(settings);
    let shop = w.app.monetization();
    let ad = AdCompleted::new("double_coins", CurrencyType::Coins, 150);

    shop.reward_ad(&ad).await.unwrap();
    let receipt = shop.reward_ad(&ad).await.unwrap();
    assert_eq!(receipt.transactions[0].source, "ad_double_coins");
    assert_eq!(receipt.balance(CurrencyType::Coins), Some(1_300));

    let err = shop.reward_ad(&ad).await.unwrap_err();
    assert_eq!(err.code, RunnerErrorCode::LimitExceeded);
    assert_eq!(w.sink.named("ad_rewarded").len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn order_redeemed_elsewhere_is_not_credited_again_offline() {
    let phone = wallet(RunnerSettings::default());
    let purchase = PurchaseSucceeded::new("gems_large", "order-42", 999, "receipt");
    phone
        .app
        .monetization()
        .complete_purchase(purchase.clone())
        .await
        .unwrap();
    let user = schema::user("kai").unwrap();
    assert_eq!(phone.remote.document(&user).unwrap()["currencies"]["gems"], 650);

    let tablet = wallet_on(
        RunnerSettings::default(),
        phone.clock.clone(),
        phone.remote.clone(),
    );
    assert_eq!(
        tablet.app.ledger().balance(CurrencyType::Gems).await.unwrap(),
        650
    );
    let events = tablet.app.ledger().events();

    // The store re-delivers the same order on the tablet while it has no connection.
    tablet.connectivity.set_online(false);
    let receipt = tablet
        .app
        .monetization()
        .complete_purchase(purchase)
        .await
        .unwrap();
    assert!(receipt.credits.outcome.is_queued());

    tablet.connectivity.set_online(true);
    let report = tablet.app.sync().drain_queue().await;
    assert_eq!(report.rejected, 1);
    assert_eq!(report.remaining, 0);

    let stored = tablet.remote.document(&user).unwrap();
    assert_eq!(stored["currencies"]["gems"], 650);
    assert_eq!(stored["monetization"]["purchaseCount"], 1);
    assert_eq!(
        tablet.app.ledger().balance(CurrencyType::Gems).await.unwrap(),
        650
    );
    assert!(tablet.app.monetization().purchase_history().unwrap().is_empty());

    let mut reverted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MonetizationEvent::PurchaseReverted { transaction_id, .. } = event {
            reverted.push(transaction_id);
        }
    }
    assert_eq!(reverted, ["order-42"]);
    let report = tablet.app.ledger().reconcile().await.unwrap();
    assert!(report.iter().all(|item| item.is_consistent()), "{report:?}");
}

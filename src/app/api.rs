use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use crate::analytics::Analytics;
use crate::app::settings::RunnerSettings;
use crate::cache::{CacheStore, InMemoryCacheStore, LocalCache};
use crate::connectivity::{ConnectivityArc, ManualConnectivity};
use crate::error::RunnerResult;
use crate::identity::{AuthStateChange, IdentityArc, StaticIdentityProvider};
use crate::leaderboard::LeaderboardEngine;
use crate::logger::Logger;
use crate::monetization::{CurrencyLedger, MonetizationService, ReceiptValidatorArc};
use crate::platform::runtime::{spawn_detached, PeriodicTask};
use crate::queue::OperationQueue;
use crate::remote::{InMemoryRemoteStore, RemoteStoreArc};
use crate::sync::{SyncEngine, SyncServices};
use crate::util::{ClockArc, Subscription, SystemClock};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@runner/app"));

pub static SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Collects the collaborators of a session. Anything not supplied gets a local default: an
/// in-memory device store, the system clock, an in-memory remote store, a signed-out identity,
/// an online connectivity flag and analytics without a sink.
#[derive(Default)]
pub struct RunnerAppBuilder {
    settings: RunnerSettings,
    cache_store: Option<Arc<dyn CacheStore>>,
    remote: Option<RemoteStoreArc>,
    identity: Option<IdentityArc>,
    connectivity: Option<ConnectivityArc>,
    clock: Option<ClockArc>,
    analytics: Option<Analytics>,
    receipt_validator: Option<ReceiptValidatorArc>,
}

impl RunnerAppBuilder {
    pub fn settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn remote(mut self, remote: RemoteStoreArc) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn identity(mut self, identity: IdentityArc) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn connectivity(mut self, connectivity: ConnectivityArc) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn clock(mut self, clock: ClockArc) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn analytics(mut self, analytics: Analytics) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn receipt_validator(mut self, validator: ReceiptValidatorArc) -> Self {
        self.receipt_validator = Some(validator);
        self
    }

    /// Validates the settings and constructs every service. Nothing runs until
    /// [`RunnerApp::start`].
    pub fn build(self) -> RunnerResult<RunnerApp> {
        self.settings.validate()?;
        let RunnerSettings {
            queue: queue_settings,
            sync: sync_settings,
            leaderboard: leaderboard_settings,
            monetization: monetization_settings,
        } = self.settings.clone();

        let clock: ClockArc = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .cache_store
            .unwrap_or_else(|| Arc::new(InMemoryCacheStore::new()));
        let cache = Arc::new(LocalCache::new(store));
        let queue = Arc::new(OperationQueue::open(Arc::clone(&cache), queue_settings));
        let remote = self
            .remote
            .unwrap_or_else(|| Arc::new(InMemoryRemoteStore::new(Arc::clone(&clock))));
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(StaticIdentityProvider::new()));
        let connectivity = self
            .connectivity
            .unwrap_or_else(|| Arc::new(ManualConnectivity::new(true)));
        let analytics = self.analytics.unwrap_or_default();

        let sync = SyncEngine::new(
            SyncServices {
                cache,
                queue,
                remote,
                connectivity: Arc::clone(&connectivity),
                clock,
                analytics,
            },
            sync_settings,
        );
        let leaderboard =
            LeaderboardEngine::new(sync.clone(), Arc::clone(&identity), leaderboard_settings);
        let ledger = CurrencyLedger::new(
            sync.clone(),
            Arc::clone(&identity),
            Arc::new(monetization_settings),
        );
        let monetization = MonetizationService::new(ledger, self.receipt_validator);

        LOGGER.debug(format!(
            "session built ({} queued operations restored)",
            sync.queue().size()
        ));
        Ok(RunnerApp {
            inner: Arc::new(AppInner {
                settings: self.settings,
                identity,
                connectivity,
                sync,
                leaderboard,
                monetization,
                tasks: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// One player session: the wired services plus their background loops.
#[derive(Clone)]
pub struct RunnerApp {
    inner: Arc<AppInner>,
}

struct AppInner {
    settings: RunnerSettings,
    identity: IdentityArc,
    connectivity: ConnectivityArc,
    sync: SyncEngine,
    leaderboard: LeaderboardEngine,
    monetization: MonetizationService,
    tasks: Mutex<Vec<PeriodicTask>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for RunnerApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerApp")
            .field("player", &self.current_player_id())
            .field("started", &self.is_started())
            .finish()
    }
}

impl RunnerApp {
    pub fn builder() -> RunnerAppBuilder {
        RunnerAppBuilder::default()
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.inner.settings
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.inner.sync
    }

    pub fn leaderboard(&self) -> &LeaderboardEngine {
        &self.inner.leaderboard
    }

    pub fn ledger(&self) -> &CurrencyLedger {
        self.inner.monetization.ledger()
    }

    pub fn monetization(&self) -> &MonetizationService {
        &self.inner.monetization
    }

    pub fn current_player_id(&self) -> Option<String> {
        self.inner.identity.current_user_id()
    }

    pub fn is_started(&self) -> bool {
        !self.inner.tasks.lock().unwrap().is_empty()
    }

    /// Attaches the identity and connectivity listeners, loads the signed-in player and spawns
    /// the background loops. Must run inside a Tokio runtime. Calling it twice is a no-op.
    pub async fn start(&self) -> RunnerResult<()> {
        if self.is_started() {
            return Ok(());
        }
        self.attach_listeners();
        if let Some(user_id) = self.current_player_id() {
            self.inner
                .sync
                .handle_auth_state(&AuthStateChange::SignedIn { user_id })
                .await;
        }
        self.spawn_loops();
        LOGGER.info(format!("runner-sync {SDK_VERSION} started"));
        Ok(())
    }

    fn attach_listeners(&self) {
        let sync = self.inner.sync.clone();
        let leaderboard = self.inner.leaderboard.clone();
        let on_auth = self.inner.identity.subscribe(Box::new(move |change| {
            let sync = sync.clone();
            let leaderboard = leaderboard.clone();
            let change = change.clone();
            spawn_detached(async move {
                if matches!(change, AuthStateChange::SignedOut { .. }) {
                    leaderboard.stop_all_listeners();
                }
                sync.handle_auth_state(&change).await;
            });
        }));

        let sync = self.inner.sync.clone();
        let identity = Arc::clone(&self.inner.identity);
        let on_reachability = self.inner.connectivity.subscribe(Box::new(move |online| {
            let sync = sync.clone();
            let player = identity.current_user_id();
            let online = *online;
            spawn_detached(async move {
                if let Some(report) = sync
                    .handle_connectivity_change(online, player.as_deref())
                    .await
                {
                    log::debug!(
                        "reconnect drain applied {} and left {}",
                        report.applied,
                        report.remaining
                    );
                }
            });
        }));

        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        subscriptions.push(on_auth);
        subscriptions.push(on_reachability);
    }

    fn spawn_loops(&self) {
        let settings = &self.inner.settings;
        let mut tasks = Vec::with_capacity(4);

        let sync = self.inner.sync.clone();
        tasks.push(PeriodicTask::spawn(
            "queue-drain",
            Duration::from_millis(settings.sync.drain_interval_millis),
            move || {
                let sync = sync.clone();
                async move {
                    if sync.is_online() && !sync.queue().is_empty() {
                        sync.drain_queue().await;
                    }
                }
            },
        ));

        let sync = self.inner.sync.clone();
        let identity = Arc::clone(&self.inner.identity);
        tasks.push(PeriodicTask::spawn(
            "refresh",
            Duration::from_millis(settings.sync.refresh_interval_millis),
            move || {
                let sync = sync.clone();
                let player = identity.current_user_id();
                async move {
                    let Some(player_id) = player else {
                        return;
                    };
                    if let Err(err) = sync.refresh(&player_id).await {
                        log::debug!("periodic refresh for {player_id} failed: {err}");
                    }
                }
            },
        ));

        let leaderboard = self.inner.leaderboard.clone();
        tasks.push(PeriodicTask::spawn(
            "ranking-pass",
            Duration::from_millis(settings.leaderboard.ranking_interval_millis),
            move || {
                let leaderboard = leaderboard.clone();
                async move {
                    leaderboard.run_ranking_pass().await;
                }
            },
        ));

        let monetization = self.inner.monetization.clone();
        tasks.push(PeriodicTask::spawn(
            "subscription-check",
            Duration::from_millis(settings.monetization.subscription_check_interval_millis),
            move || {
                let monetization = monetization.clone();
                async move {
                    monetization.check_subscriptions();
                }
            },
        ));

        *self.inner.tasks.lock().unwrap() = tasks;
    }

    /// Stops the background loops, waiting for any run in progress, and detaches every listener.
    /// Queued operations stay persisted for the next session.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in &tasks {
            task.shutdown().await;
        }
        for subscription in self.inner.subscriptions.lock().unwrap().drain(..) {
            subscription.unsubscribe();
        }
        self.inner.leaderboard.stop_all_listeners();
        self.inner.sync.stop_listening();
        LOGGER.info(format!(
            "session stopped with {} operations pending",
            self.inner.sync.queue().size()
        ));
    }
}

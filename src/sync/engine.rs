use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::analytics::{Analytics, MetricEvent};
use crate::cache::{keys, CachedBlob, LocalCache};
use crate::connectivity::ConnectivityArc;
use crate::error::{
    conflict, invalid_input, remote_unavailable, RunnerError, RunnerErrorCode, RunnerResult,
};
use crate::identity::AuthStateChange;
use crate::logger::Logger;
use crate::model::{BotRecord, PlayerProfile, SpendSegment};
use crate::platform::runtime::with_timeout;
use crate::queue::{NackOutcome, OperationKind, OperationQueue, QueueEvent, QueuedOperation};
use crate::remote::{
    assign_field, encode_document, lookup_field, merge_into, schema, CommitResult, DocumentData,
    DocumentListener, DocumentPath, DocumentQuery, DocumentSnapshot, QueryListener,
    RemoteStoreArc, WriteOperation,
};
use crate::sync::events::{ChangeOrigin, DrainReport, SyncEvent};
use crate::sync::merge::{
    counter_deltas, decide_push, diff_patch, overlay_remote, rebase_patch, version_of,
    FieldDeltas, PushDecision, VERSION_FIELD,
};
use crate::sync::quota::{QuotaMeter, QuotaUsage};
use crate::sync::settings::SyncSettings;
use crate::sync::state::{CollectionState, ManagedCollection, StateTable};
use crate::util::{ClockArc, EventBus, Subscription};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@runner/sync"));

/// Collaborators the engine is constructed with.
#[derive(Clone)]
pub struct SyncServices {
    pub cache: Arc<LocalCache>,
    pub queue: Arc<OperationQueue>,
    pub remote: RemoteStoreArc,
    pub connectivity: ConnectivityArc,
    pub clock: ClockArc,
    pub analytics: Analytics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Confirmed against the remote store.
    Fresh,
    /// Last known copy; the remote store could not be consulted.
    Stale,
    /// Synthesised locally and not yet known to the remote store.
    Provisional,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Loaded<T> {
    pub value: T,
    pub freshness: Freshness,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed,
    /// Recorded in the operation queue; the cache holds the intended state.
    Queued,
    /// Nothing differed from the cached copy.
    Unchanged,
}

impl WriteOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued)
    }
}

/// Result of [`SyncEngine::update_profile_with`].
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileMutation<T> {
    pub value: T,
    pub profile: PlayerProfile,
    pub outcome: WriteOutcome,
}

/// Offline-first arbiter between the device cache, the operation queue and the remote store.
///
/// Every write is applied to the cache first and then either committed or queued. Reads prefer the
/// remote store when it is reachable and fall back to the cache otherwise. Operations on one
/// logical resource (a profile, a bot collection, a leaderboard partition) are serialised through
/// [`SyncEngine::lock_resource`].
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    services: SyncServices,
    settings: SyncSettings,
    quota: QuotaMeter,
    states: StateTable,
    events: EventBus<SyncEvent>,
    resource_locks: Mutex<HashMap<String, Arc<async_lock::Mutex<()>>>>,
    drain_lock: async_lock::Mutex<()>,
    profile_listener: Mutex<Option<(String, Subscription)>>,
    queue_subscription: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("online", &self.is_online())
            .field("pending", &self.inner.services.queue.size())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(services: SyncServices, settings: SyncSettings) -> Self {
        let quota = QuotaMeter::new(settings.daily_read_budget, settings.daily_write_budget);
        let engine = Self {
            inner: Arc::new(SyncInner {
                services,
                settings,
                quota,
                states: StateTable::default(),
                events: EventBus::new(),
                resource_locks: Mutex::new(HashMap::new()),
                drain_lock: async_lock::Mutex::new(()),
                profile_listener: Mutex::new(None),
                queue_subscription: Mutex::new(None),
            }),
        };

        let events = engine.inner.events.clone();
        let subscription = engine.inner.services.queue.subscribe(move |event| match event {
            QueueEvent::Overflow { evicted } => {
                events.publish(SyncEvent::QueueOverflow {
                    evicted: evicted.len(),
                });
                events.publish(SyncEvent::SyncDegraded {
                    reason: format!("{} queued operations evicted on overflow", evicted.len()),
                });
            }
            QueueEvent::Dropped { operation } => {
                events.publish(SyncEvent::SyncDegraded {
                    reason: format!(
                        "gave up on {} after {} attempts",
                        operation.path, operation.retry_count
                    ),
                });
            }
        });
        *engine.inner.queue_subscription.lock().unwrap() = Some(subscription);
        engine
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.inner.services.cache
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.inner.services.queue
    }

    pub fn clock(&self) -> &ClockArc {
        &self.inner.services.clock
    }

    pub fn analytics(&self) -> &Analytics {
        &self.inner.services.analytics
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.services.clock.now()
    }

    pub fn is_online(&self) -> bool {
        self.inner.services.connectivity.is_online()
    }

    pub fn quota_usage(&self) -> QuotaUsage {
        self.inner.quota.usage(self.now())
    }

    pub fn state(&self, collection: ManagedCollection) -> CollectionState {
        self.inner.states.get(collection)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn events(&self) -> async_channel::Receiver<SyncEvent> {
        self.inner.events.channel()
    }

    pub fn publish(&self, event: SyncEvent) {
        if let SyncEvent::SyncDegraded { reason } = &event {
            self.analytics().log_event(&MetricEvent::SyncDegraded {
                reason: reason.clone(),
            });
        }
        self.inner.events.publish(event);
    }

    /// Serialises async work on one logical resource. Hold the guard for the whole operation.
    pub async fn lock_resource(&self, key: &str) -> async_lock::MutexGuardArc<()> {
        let lock = {
            let mut locks = self.inner.resource_locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(async_lock::Mutex::new(()))),
            )
        };
        lock.lock_arc().await
    }

    pub fn begin_sync(&self, collection: ManagedCollection) {
        if let Some(state) = self.inner.states.begin(collection) {
            self.inner
                .events
                .publish(SyncEvent::StateChanged { collection, state });
        }
    }

    pub fn finish_sync(&self, collection: ManagedCollection, stale: bool) {
        if let Some(state) = self.inner.states.finish(collection, stale) {
            self.inner
                .events
                .publish(SyncEvent::StateChanged { collection, state });
        }
    }

    // ---- cache helpers -------------------------------------------------------------------

    pub fn read_cached<T>(&self, key: &str) -> Option<CachedBlob<T>>
    where
        T: DeserializeOwned,
    {
        self.cache().read_blob(key)
    }

    /// Writes through to the cache; device failures are logged and the memory copy kept.
    pub fn store_cached<T>(&self, key: &str, value: &T, version: u64, server_time: Option<DateTime<Utc>>)
    where
        T: Serialize,
    {
        let blob = CachedBlob::new(value, self.now())
            .with_version(version)
            .with_server_time(server_time);
        if let Err(err) = self.cache().write_blob(key, &blob) {
            LOGGER.warn(format!("{key} cached in memory only: {err}"));
        }
    }

    pub fn cached_profile(&self, player_id: &str) -> Option<PlayerProfile> {
        self.read_cached::<PlayerProfile>(&keys::profile(player_id))
            .map(|blob| blob.value)
    }

    pub fn cached_bots(&self, owner_id: &str) -> Vec<BotRecord> {
        self.cached_bot_map(owner_id).into_values().collect()
    }

    // ---- remote helpers ------------------------------------------------------------------

    fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.settings.remote_timeout_millis)
    }

    fn ensure_online(&self, label: &str) -> RunnerResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(remote_unavailable(format!("{label}: device is offline")))
        }
    }

    /// Metered, time-bounded document read.
    pub async fn remote_get(&self, path: &DocumentPath) -> RunnerResult<DocumentSnapshot> {
        let label = format!("get {path}");
        self.ensure_online(&label)?;
        if !self.inner.quota.try_read(self.now(), 1) {
            return Err(remote_unavailable(format!("{label}: daily read budget exhausted")));
        }
        with_timeout(
            self.remote_timeout(),
            &label,
            self.inner.services.remote.get(path),
        )
        .await
    }

    pub async fn remote_query(&self, query: &DocumentQuery) -> RunnerResult<Vec<DocumentSnapshot>> {
        let label = format!("query {}", query.collection());
        self.ensure_online(&label)?;
        if !self.inner.quota.try_read(self.now(), 1) {
            return Err(remote_unavailable(format!("{label}: daily read budget exhausted")));
        }
        let results = with_timeout(
            self.remote_timeout(),
            &label,
            self.inner.services.remote.run_query(query),
        )
        .await?;
        if results.len() > 1 {
            // Charged after the fact; the first read was reserved up front.
            let _ = self
                .inner
                .quota
                .try_read(self.now(), results.len() as u64 - 1);
        }
        Ok(results)
    }

    /// Metered, time-bounded atomic commit. Never queues.
    pub async fn remote_commit(&self, writes: Vec<WriteOperation>) -> RunnerResult<CommitResult> {
        self.ensure_online("commit")?;
        if !self.inner.quota.try_write(self.now(), writes.len() as u64) {
            return Err(remote_unavailable("commit: daily write budget exhausted"));
        }
        with_timeout(
            self.remote_timeout(),
            "commit",
            self.inner.services.remote.commit(writes),
        )
        .await
    }

    pub fn listen_document(
        &self,
        path: &DocumentPath,
        listener: DocumentListener,
    ) -> RunnerResult<Subscription> {
        self.ensure_online(&format!("listen {path}"))?;
        self.inner.services.remote.listen_document(path, listener)
    }

    pub fn listen_query(
        &self,
        query: &DocumentQuery,
        listener: QueryListener,
    ) -> RunnerResult<Subscription> {
        self.ensure_online(&format!("listen {}", query.collection()))?;
        self.inner.services.remote.listen_query(query, listener)
    }

    /// Commits `writes` atomically when possible, otherwise queues them as one operation.
    ///
    /// Writes touching a document that already has queued operations are queued behind them so
    /// that per-document order holds. Several writes stay a single all-or-nothing unit in the
    /// queue as well.
    pub async fn commit_or_enqueue(&self, writes: Vec<WriteOperation>) -> RunnerResult<WriteOutcome> {
        self.commit_or_enqueue_with(writes, FieldDeltas::new()).await
    }

    async fn commit_or_enqueue_with(
        &self,
        writes: Vec<WriteOperation>,
        deltas: FieldDeltas,
    ) -> RunnerResult<WriteOutcome> {
        if writes.is_empty() {
            return Ok(WriteOutcome::Unchanged);
        }
        let queue = self.queue();
        let behind_pending = writes
            .iter()
            .any(|write| queue.has_pending_for(write.path()));

        if !behind_pending && self.is_online() {
            match self.remote_commit(writes.clone()).await {
                Ok(_) => return Ok(WriteOutcome::Committed),
                Err(err) if err.code == RunnerErrorCode::RemoteUnavailable => {
                    LOGGER.info(format!("write deferred to queue: {err}"));
                }
                Err(err) => return Err(err),
            }
        }

        self.enqueue_writes(&writes, deltas);
        Ok(WriteOutcome::Queued)
    }

    /// Queues `writes` as one operation. `deltas` describes the counter movement of the first
    /// write when it is a profile patch.
    pub fn enqueue_writes(&self, writes: &[WriteOperation], deltas: FieldDeltas) {
        if let Some((path, kind)) = OperationKind::from_writes(writes) {
            self.queue().enqueue_with_deltas(path, kind, deltas, self.now());
        }
    }

    /// Replays one bounded batch of queued operations.
    ///
    /// A failed operation is rescheduled and later operations for the same document are left for
    /// a later cycle. Connectivity failures end the cycle early. An operation whose precondition
    /// fails is settled for good: a create counts as applied, anything else is removed and
    /// reported with [`SyncEvent::WriteRejected`]. Either way the profile patches still queued
    /// are rebased onto the remote document first.
    pub async fn drain_queue(&self) -> DrainReport {
        let _drain = self.inner.drain_lock.lock().await;
        let queue = self.queue();
        let mut report = DrainReport::default();

        if !self.is_online() || queue.is_empty() {
            report.remaining = queue.size();
            return report;
        }

        let budget = self.quota_usage().remaining_writes();
        let limit = (self.inner.settings.drain_batch_size as u64).min(budget) as usize;
        if limit == 0 {
            LOGGER.info("daily write budget exhausted; queue drain postponed");
        }
        let batch = queue.peek_batch(limit, self.now());
        let mut failed_keys: HashSet<String> = HashSet::new();

        for queued in batch {
            let key = queued.key();
            if failed_keys.contains(&key) {
                continue;
            }
            // Re-read: a rebase earlier in this cycle may have rewritten the patch.
            let Some(operation) = queue.get(&queued.id) else {
                continue;
            };
            match self.remote_commit(operation.to_writes()).await {
                Ok(_) => {
                    queue.ack(&operation.id);
                    report.applied += 1;
                }
                Err(err) if err.code == RunnerErrorCode::Conflict => {
                    match self.settle_conflict(&operation).await {
                        Ok(()) if operation.is_create() => {
                            LOGGER.debug(format!(
                                "{} already exists; create treated as applied",
                                operation.path
                            ));
                            queue.ack(&operation.id);
                            report.applied += 1;
                        }
                        Ok(()) => {
                            queue.ack(&operation.id);
                            report.rejected += 1;
                            self.publish_rejection(&operation, &err);
                        }
                        Err(settle_err) => {
                            LOGGER.warn(format!(
                                "could not settle conflict on {}: {settle_err}",
                                operation.path
                            ));
                            failed_keys.insert(key);
                            match queue.nack(&operation.id, self.now()) {
                                NackOutcome::Rescheduled { .. } => report.failed += 1,
                                NackOutcome::Dropped => report.dropped += 1,
                                NackOutcome::Unknown => {}
                            }
                            if settle_err.code == RunnerErrorCode::RemoteUnavailable {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    failed_keys.insert(key);
                    match queue.nack(&operation.id, self.now()) {
                        NackOutcome::Rescheduled { .. } => report.failed += 1,
                        NackOutcome::Dropped => report.dropped += 1,
                        NackOutcome::Unknown => {}
                    }
                    if err.code == RunnerErrorCode::RemoteUnavailable {
                        LOGGER.info(format!("queue drain interrupted: {err}"));
                        break;
                    }
                    LOGGER.warn(format!("queued write to {} rejected: {err}", operation.path));
                }
            }
        }

        report.remaining = queue.size();
        if report.applied + report.failed + report.dropped + report.rejected > 0 {
            LOGGER.debug(format!(
                "drained {} operations ({} failed, {} dropped, {} rejected, {} remaining)",
                report.applied, report.failed, report.dropped, report.rejected, report.remaining
            ));
            if report.applied > 0 {
                self.analytics().log_event(&MetricEvent::QueueDrained {
                    applied: report.applied,
                    remaining: report.remaining,
                });
            }
            self.publish(SyncEvent::QueueDrained(report.clone()));
        }
        report
    }

    /// A queued operation hit a failed precondition: the remote document it expected to create
    /// already exists. Profile patches queued after it were diffed against a copy the remote
    /// store never had, so they are rebased on the remote document first.
    async fn settle_conflict(&self, operation: &QueuedOperation) -> RunnerResult<()> {
        match operation.paths().find_map(profile_owner) {
            Some(player_id) => self.rebase_profile(&player_id, &operation.id).await,
            None => Ok(()),
        }
    }

    fn publish_rejection(&self, operation: &QueuedOperation, err: &RunnerError) {
        let paths: Vec<String> = operation
            .paths()
            .map(DocumentPath::canonical_string)
            .collect();
        LOGGER.warn(format!("queued write to {} refused: {err}", paths.join(", ")));
        self.publish(SyncEvent::WriteRejected {
            paths,
            reason: err.to_string(),
        });
        self.publish(SyncEvent::SyncDegraded {
            reason: format!("queued write to {} refused: {}", operation.path, err.message()),
        });
    }

    /// Replays the queued patches for `player_id`'s profile on top of the remote document and
    /// makes the result the cached copy. Counters move by the amount the player moved them;
    /// everything else keeps the value the player wrote. `skip` is left untouched.
    async fn rebase_profile(&self, player_id: &str, skip: &str) -> RunnerResult<()> {
        let key = keys::profile(player_id);
        let path = schema::user(player_id)?;
        let _guard = self.lock_resource(&key).await;
        let snapshot = self.remote_get(&path).await?;
        let update_time = snapshot.update_time();
        let Some(mut running) = snapshot.into_data() else {
            LOGGER.debug(format!("{path} does not exist yet; nothing to rebase onto"));
            return Ok(());
        };

        let rebased = self.queue().rewrite_for(&path, |operation| {
            if operation.id == skip {
                return;
            }
            let deltas = operation.deltas.clone();
            let Some(patch) = operation.patch_mut() else {
                return;
            };
            let mut next = rebase_patch(patch, &deltas, PlayerProfile::HIGH_WATER_FIELDS, &running);
            let version = version_of(&next).max(version_of(&running) + 1);
            next.insert(VERSION_FIELD.to_string(), Value::from(version));
            if let Some(total) =
                lookup_field(&next, "monetization.totalSpentCents").and_then(Value::as_u64)
            {
                if let Ok(segment) = serde_json::to_value(SpendSegment::from_total_spent(total)) {
                    assign_field(&mut next, "monetization.segment", segment);
                }
            }
            merge_into(&mut running, &next);
            *patch = next;
        });

        let profile: PlayerProfile = serde_json::from_value(Value::Object(running.clone()))
            .map_err(|err| invalid_input(format!("remote profile is malformed: {err}")))?;
        LOGGER.info(format!(
            "rebased {rebased} queued operations for {player_id} onto the remote profile"
        ));
        self.store_cached(&key, &profile, version_of(&running), update_time);
        self.publish(SyncEvent::ProfileChanged {
            profile,
            origin: ChangeOrigin::Remote,
        });
        Ok(())
    }

    // ---- profile -------------------------------------------------------------------------

    /// Read-through profile load. Creates the default profile on a player's first run.
    pub async fn load_profile(&self, player_id: &str) -> RunnerResult<Loaded<PlayerProfile>> {
        let _guard = self.lock_resource(&keys::profile(player_id)).await;
        self.begin_sync(ManagedCollection::Profile);
        let result = self.load_profile_locked(player_id).await;
        let stale = !matches!(&result, Ok(loaded) if loaded.freshness == Freshness::Fresh);
        self.finish_sync(ManagedCollection::Profile, stale);
        result
    }

    async fn load_profile_locked(&self, player_id: &str) -> RunnerResult<Loaded<PlayerProfile>> {
        if player_id.trim().is_empty() {
            return Err(invalid_input("player id cannot be empty"));
        }
        let key = keys::profile(player_id);
        let path = schema::user(player_id)?;
        let cached: Option<CachedBlob<PlayerProfile>> = self.read_cached(&key);

        if let Some(blob) = &cached {
            let max_age = chrono::Duration::milliseconds(self.inner.settings.profile_max_age_millis as i64);
            if self.is_listening_to(player_id)
                && blob.server_time.is_some()
                && blob.is_fresh(max_age, self.now())
            {
                return Ok(Loaded {
                    value: blob.value.clone(),
                    freshness: Freshness::Fresh,
                });
            }
        }

        if self.is_online() {
            match self.remote_get(&path).await {
                Ok(snapshot) => match snapshot.data() {
                    Some(remote) => {
                        let keep_local = cached.as_ref().is_some_and(|blob| {
                            decide_push(blob.version, version_of(remote)) == PushDecision::Discard
                                && self.queue().has_pending_for(&path)
                        });
                        let profile = match (&cached, keep_local) {
                            (Some(blob), true) => blob.value.clone(),
                            _ => self.reconcile_profile(
                                &key,
                                cached.as_ref(),
                                remote,
                                snapshot.update_time(),
                            )?,
                        };
                        return Ok(Loaded {
                            value: profile,
                            freshness: Freshness::Fresh,
                        });
                    }
                    None => return self.create_remote_profile(player_id, &path, cached).await,
                },
                Err(err) if err.is_retriable() => {
                    LOGGER.info(format!("profile {player_id} served from cache: {err}"));
                }
                Err(err) => return Err(err),
            }
        }

        self.load_profile_offline(player_id, &path, cached)
    }

    fn load_profile_offline(
        &self,
        player_id: &str,
        path: &DocumentPath,
        cached: Option<CachedBlob<PlayerProfile>>,
    ) -> RunnerResult<Loaded<PlayerProfile>> {
        if let Some(blob) = cached {
            return Ok(Loaded {
                value: blob.value,
                freshness: Freshness::Stale,
            });
        }
        if !self.inner.settings.allow_offline_first_run {
            return Err(remote_unavailable(format!(
                "no cached profile for {player_id} and the remote store is unreachable"
            )));
        }

        let profile = self.default_profile(player_id);
        self.store_cached(&keys::profile(player_id), &profile, profile.sync_version, None);
        if !self.queue().has_pending_for(path) {
            self.queue().enqueue(
                path.clone(),
                OperationKind::CreateIfAbsent {
                    data: encode_document(&profile)?,
                },
                self.now(),
            );
        }
        LOGGER.info(format!("created provisional profile for {player_id} while offline"));
        self.analytics()
            .log_event(&MetricEvent::ProfileCreated { offline: true });
        self.publish(SyncEvent::ProfileChanged {
            profile: profile.clone(),
            origin: ChangeOrigin::Local,
        });
        Ok(Loaded {
            value: profile,
            freshness: Freshness::Provisional,
        })
    }

    async fn create_remote_profile(
        &self,
        player_id: &str,
        path: &DocumentPath,
        cached: Option<CachedBlob<PlayerProfile>>,
    ) -> RunnerResult<Loaded<PlayerProfile>> {
        let first_run = cached.is_none();
        let profile = match cached {
            Some(blob) => blob.value,
            None => self.default_profile(player_id),
        };
        let data = encode_document(&profile)?;
        let key = keys::profile(player_id);

        match self
            .remote_commit(vec![WriteOperation::create(path.clone(), data.clone())])
            .await
        {
            Ok(commit) => {
                self.store_cached(&key, &profile, profile.sync_version, Some(commit.commit_time));
                if first_run {
                    LOGGER.info(format!("created profile for {player_id}"));
                    self.analytics()
                        .log_event(&MetricEvent::ProfileCreated { offline: false });
                    self.publish(SyncEvent::ProfileChanged {
                        profile: profile.clone(),
                        origin: ChangeOrigin::Local,
                    });
                }
                Ok(Loaded {
                    value: profile,
                    freshness: Freshness::Fresh,
                })
            }
            Err(err) if err.code == RunnerErrorCode::Conflict => {
                // Another device won the first-run race.
                let snapshot = self.remote_get(path).await?;
                let Some(remote) = snapshot.data() else {
                    return Err(conflict(format!("{path} vanished while being created")));
                };
                let cached = self.read_cached::<PlayerProfile>(&key);
                let profile =
                    self.reconcile_profile(&key, cached.as_ref(), remote, snapshot.update_time())?;
                Ok(Loaded {
                    value: profile,
                    freshness: Freshness::Fresh,
                })
            }
            Err(err) if err.is_retriable() => {
                self.store_cached(&key, &profile, profile.sync_version, None);
                if !self.queue().has_pending_for(path) {
                    self.queue()
                        .enqueue(path.clone(), OperationKind::CreateIfAbsent { data }, self.now());
                }
                Ok(Loaded {
                    value: profile,
                    freshness: Freshness::Provisional,
                })
            }
            Err(err) => Err(err),
        }
    }

    fn default_profile(&self, player_id: &str) -> PlayerProfile {
        PlayerProfile::new_default(
            player_id,
            self.inner.settings.starting_balances.clone(),
            self.now(),
        )
    }

    /// Folds a remote profile document into the cache; server fields win.
    fn reconcile_profile(
        &self,
        key: &str,
        cached: Option<&CachedBlob<PlayerProfile>>,
        remote: &DocumentData,
        update_time: Option<DateTime<Utc>>,
    ) -> RunnerResult<PlayerProfile> {
        let local = match cached {
            Some(blob) => encode_document(&blob.value)?,
            None => DocumentData::new(),
        };
        let merged = overlay_remote(&local, remote);
        let profile: PlayerProfile = serde_json::from_value(Value::Object(merged))
            .map_err(|err| invalid_input(format!("remote profile is malformed: {err}")))?;

        let changed = cached.map_or(true, |blob| blob.value != profile);
        self.store_cached(key, &profile, version_of(remote), update_time);
        if changed {
            self.publish(SyncEvent::ProfileChanged {
                profile: profile.clone(),
                origin: ChangeOrigin::Remote,
            });
        }
        Ok(profile)
    }

    /// Validates and writes a profile: cache first, then remote or queue.
    pub async fn update_profile(&self, profile: PlayerProfile) -> RunnerResult<WriteOutcome> {
        profile.validate()?;
        let _guard = self.lock_resource(&keys::profile(&profile.player_id)).await;
        let (_, outcome) = self.write_profile_locked(profile, Vec::new()).await?;
        Ok(outcome)
    }

    /// Read-modify-write on the current profile under its lock.
    ///
    /// `mutate` may push extra writes (ledger rows, purchase records); they are committed in the
    /// same atomic batch as the profile patch, or queued right behind it.
    pub async fn update_profile_with<T, F>(
        &self,
        player_id: &str,
        mutate: F,
    ) -> RunnerResult<ProfileMutation<T>>
    where
        T: Send,
        F: FnOnce(&mut PlayerProfile, &mut Vec<WriteOperation>) -> RunnerResult<T> + Send,
    {
        let _guard = self.lock_resource(&keys::profile(player_id)).await;
        let mut profile = match self.cached_profile(player_id) {
            Some(profile) => profile,
            None => self.load_profile_locked(player_id).await?.value,
        };
        let mut extra_writes = Vec::new();
        let value = mutate(&mut profile, &mut extra_writes)?;
        profile.validate()?;
        let (profile, outcome) = self.write_profile_locked(profile, extra_writes).await?;
        Ok(ProfileMutation {
            value,
            profile,
            outcome,
        })
    }

    async fn write_profile_locked(
        &self,
        mut profile: PlayerProfile,
        extra_writes: Vec<WriteOperation>,
    ) -> RunnerResult<(PlayerProfile, WriteOutcome)> {
        let key = keys::profile(&profile.player_id);
        let path = schema::user(&profile.player_id)?;
        let cached: Option<CachedBlob<PlayerProfile>> = self.read_cached(&key);

        let before = match &cached {
            Some(blob) => Some(encode_document(&blob.value)?),
            None => None,
        };
        if let Some(blob) = &cached {
            profile.sync_version = blob.value.sync_version;
            if blob.value == profile && extra_writes.is_empty() {
                return Ok((profile, WriteOutcome::Unchanged));
            }
        }

        let version = cached
            .as_ref()
            .map_or(0, |blob| blob.version.max(blob.value.sync_version))
            + 1;
        profile.sync_version = version;
        let after = encode_document(&profile)?;
        let (patch, deltas) = match &before {
            Some(before) => (
                diff_patch(before, &after),
                counter_deltas(before, &after, PlayerProfile::COUNTER_FIELDS),
            ),
            None => (after, FieldDeltas::new()),
        };

        self.store_cached(
            &key,
            &profile,
            version,
            cached.as_ref().and_then(|blob| blob.server_time),
        );

        let mut writes = Vec::with_capacity(extra_writes.len() + 1);
        writes.push(WriteOperation::merge(path, patch));
        writes.extend(extra_writes);
        let outcome = match self.commit_or_enqueue_with(writes, deltas).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Terminal failure: put the pre-write copy back.
                let restored = match &cached {
                    Some(blob) => self.cache().write_blob(&key, blob),
                    None => self.cache().remove(&key),
                };
                if let Err(restore_err) = restored {
                    LOGGER.warn(format!("could not restore {key}: {restore_err}"));
                }
                return Err(err);
            }
        };
        self.publish(SyncEvent::ProfileChanged {
            profile: profile.clone(),
            origin: ChangeOrigin::Local,
        });
        Ok((profile, outcome))
    }

    /// Applies a real-time push for a profile document.
    pub fn apply_profile_push(&self, snapshot: &DocumentSnapshot) {
        let Some(remote) = snapshot.data() else {
            return;
        };
        let player_id = snapshot.id();
        let key = keys::profile(player_id);
        let cached: Option<CachedBlob<PlayerProfile>> = self.read_cached(&key);
        let local_version = cached.as_ref().map_or(0, |blob| blob.version);
        let remote_version = version_of(remote);

        if decide_push(local_version, remote_version) == PushDecision::Discard {
            LOGGER.debug(format!(
                "discarding stale push for {} (remote v{remote_version}, local v{local_version})",
                snapshot.path()
            ));
            self.publish(SyncEvent::RemotePushDiscarded {
                path: snapshot.path().canonical_string(),
                remote_version,
                local_version,
            });
            return;
        }

        if let Err(err) =
            self.reconcile_profile(&key, cached.as_ref(), remote, snapshot.update_time())
        {
            LOGGER.warn(format!("ignoring malformed push for {}: {err}", snapshot.path()));
        }
    }

    /// Attaches the real-time listener for `player_id`, replacing any previous one.
    pub fn listen_profile(&self, player_id: &str) -> RunnerResult<()> {
        let path = schema::user(player_id)?;
        let weak = Arc::downgrade(&self.inner);
        let subscription = self.listen_document(
            &path,
            Arc::new(move |snapshot: &DocumentSnapshot| {
                if let Some(inner) = weak.upgrade() {
                    SyncEngine { inner }.apply_profile_push(snapshot);
                }
            }),
        )?;
        *self.inner.profile_listener.lock().unwrap() = Some((player_id.to_string(), subscription));
        Ok(())
    }

    pub fn stop_listening(&self) {
        let previous = self.inner.profile_listener.lock().unwrap().take();
        drop(previous);
    }

    pub fn is_listening_to(&self, player_id: &str) -> bool {
        self.inner
            .profile_listener
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|(current, _)| current == player_id)
    }

    // ---- bots ----------------------------------------------------------------------------

    fn cached_bot_map(&self, owner_id: &str) -> BTreeMap<String, BotRecord> {
        self.read_cached::<BTreeMap<String, BotRecord>>(&keys::bots(owner_id))
            .map(|blob| blob.value)
            .unwrap_or_default()
    }

    pub async fn save_bot(&self, mut bot: BotRecord) -> RunnerResult<WriteOutcome> {
        bot.validate()?;
        let key = keys::bots(&bot.owner_id);
        let _guard = self.lock_resource(&key).await;
        bot.last_modified = self.now();
        let path = schema::bot(&bot.owner_id, &bot.bot_id)?;
        let data = encode_document(&bot)?;

        let previous: Option<CachedBlob<BTreeMap<String, BotRecord>>> = self.read_cached(&key);
        let mut bots = previous
            .as_ref()
            .map(|blob| blob.value.clone())
            .unwrap_or_default();
        bots.insert(bot.bot_id.clone(), bot.clone());
        self.store_cached(&key, &bots, 0, None);
        self.publish(SyncEvent::BotsChanged {
            owner_id: bot.owner_id.clone(),
        });

        match self
            .commit_or_enqueue(vec![WriteOperation::set(path, data)])
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let restored = match &previous {
                    Some(blob) => self.cache().write_blob(&key, blob),
                    None => self.cache().remove(&key),
                };
                if let Err(restore_err) = restored {
                    LOGGER.warn(format!("could not restore {key}: {restore_err}"));
                }
                self.publish(SyncEvent::BotsChanged {
                    owner_id: bot.owner_id.clone(),
                });
                Err(err)
            }
        }
    }

    pub async fn delete_bot(&self, owner_id: &str, bot_id: &str) -> RunnerResult<WriteOutcome> {
        if owner_id.trim().is_empty() || bot_id.trim().is_empty() {
            return Err(invalid_input("bots need both an owner id and a bot id"));
        }
        let key = keys::bots(owner_id);
        let _guard = self.lock_resource(&key).await;
        let path = schema::bot(owner_id, bot_id)?;

        let mut bots = self.cached_bot_map(owner_id);
        if bots.remove(bot_id).is_some() {
            self.store_cached(&key, &bots, 0, None);
            self.publish(SyncEvent::BotsChanged {
                owner_id: owner_id.to_string(),
            });
        }
        self.commit_or_enqueue(vec![WriteOperation::delete(path)])
            .await
    }

    /// Read-through load of a player's bot collection. Bots with queued local changes keep their
    /// local state.
    pub async fn load_bots(&self, owner_id: &str) -> RunnerResult<Loaded<Vec<BotRecord>>> {
        let key = keys::bots(owner_id);
        let _guard = self.lock_resource(&key).await;
        self.begin_sync(ManagedCollection::Bots);
        let cached: Option<CachedBlob<BTreeMap<String, BotRecord>>> = self.read_cached(&key);

        if self.is_online() {
            let query = DocumentQuery::new(schema::bots(owner_id)?);
            match self.remote_query(&query).await {
                Ok(snapshots) => {
                    let local = cached.map(|blob| blob.value).unwrap_or_default();
                    let merged = self.merge_bots(owner_id, local, &snapshots)?;
                    self.store_cached(&key, &merged, 0, Some(self.now()));
                    self.publish(SyncEvent::BotsChanged {
                        owner_id: owner_id.to_string(),
                    });
                    self.finish_sync(ManagedCollection::Bots, false);
                    return Ok(Loaded {
                        value: merged.into_values().collect(),
                        freshness: Freshness::Fresh,
                    });
                }
                Err(err) if err.is_retriable() => {
                    LOGGER.info(format!("bots for {owner_id} served from cache: {err}"));
                }
                Err(err) => {
                    self.finish_sync(ManagedCollection::Bots, true);
                    return Err(err);
                }
            }
        }

        self.finish_sync(ManagedCollection::Bots, true);
        Ok(match cached {
            Some(blob) => Loaded {
                value: blob.value.into_values().collect(),
                freshness: Freshness::Stale,
            },
            None => Loaded {
                value: Vec::new(),
                freshness: Freshness::Provisional,
            },
        })
    }

    fn merge_bots(
        &self,
        owner_id: &str,
        local: BTreeMap<String, BotRecord>,
        snapshots: &[DocumentSnapshot],
    ) -> RunnerResult<BTreeMap<String, BotRecord>> {
        let mut merged = BTreeMap::new();
        for snapshot in snapshots {
            match snapshot.decode::<BotRecord>() {
                Ok(Some(bot)) => {
                    merged.insert(snapshot.id().to_string(), bot);
                }
                Ok(None) => {}
                Err(err) => LOGGER.warn(format!("skipping bot document: {err}")),
            }
        }

        let remote_ids: Vec<String> = merged.keys().cloned().collect();
        for bot_id in remote_ids {
            if !local.contains_key(&bot_id)
                && self.queue().has_pending_for(&schema::bot(owner_id, &bot_id)?)
            {
                merged.remove(&bot_id);
            }
        }
        for (bot_id, bot) in local {
            if self.queue().has_pending_for(&schema::bot(owner_id, &bot_id)?) {
                merged.insert(bot_id, bot);
            }
        }
        Ok(merged)
    }

    // ---- lifecycle -----------------------------------------------------------------------

    /// One refresh pass for the signed-in player's collections.
    pub async fn refresh(&self, player_id: &str) -> RunnerResult<()> {
        self.load_profile(player_id).await?;
        self.load_bots(player_id).await?;
        Ok(())
    }

    /// Reacts to a reachability change. Coming back online drains the queue and refreshes.
    pub async fn handle_connectivity_change(
        &self,
        online: bool,
        active_player: Option<&str>,
    ) -> Option<DrainReport> {
        self.publish(SyncEvent::ConnectivityChanged { online });
        if !online {
            LOGGER.info("connectivity lost; remote calls suspended");
            return None;
        }

        LOGGER.info(format!(
            "connectivity restored; replaying {} queued operations",
            self.queue().size()
        ));
        let report = self.drain_queue().await;
        if let Some(player_id) = active_player {
            if let Err(err) = self.refresh(player_id).await {
                LOGGER.warn(format!("refresh after reconnect failed: {err}"));
            }
            if !self.is_listening_to(player_id) {
                if let Err(err) = self.listen_profile(player_id) {
                    LOGGER.warn(format!("could not attach profile listener: {err}"));
                }
            }
        }
        Some(report)
    }

    pub async fn handle_auth_state(&self, change: &AuthStateChange) {
        match change {
            AuthStateChange::SignedIn { user_id } => {
                if let Err(err) = self.load_profile(user_id).await {
                    LOGGER.warn(format!("initial profile load for {user_id} failed: {err}"));
                }
                if self.is_online() {
                    if let Err(err) = self.listen_profile(user_id) {
                        LOGGER.warn(format!("could not attach profile listener: {err}"));
                    }
                }
            }
            AuthStateChange::SignedOut { user_id } => {
                self.stop_listening();
                self.purge_player_cache(user_id);
                self.inner.states.reset();
                LOGGER.info(format!("signed out {user_id}; device cache purged"));
            }
        }
    }

    /// Removes every cached blob that belongs to `player_id` or to the signed-in session.
    pub fn purge_player_cache(&self, player_id: &str) {
        for key in keys::player_scoped(player_id) {
            if let Err(err) = self.cache().remove(&key) {
                LOGGER.warn(format!("failed to purge {key}: {err}"));
            }
        }
        for prefix in keys::SESSION_PREFIXES {
            self.cache().purge_prefix(prefix);
        }
    }

    /// Deletes the player's remote documents and wipes every local trace, pending writes included.
    pub async fn delete_account(&self, player_id: &str) -> RunnerResult<()> {
        let _guard = self.lock_resource(&keys::profile(player_id)).await;
        self.ensure_online("delete account")?;

        let mut writes = Vec::new();
        for collection in [schema::bots(player_id)?, schema::purchases(player_id)?] {
            for snapshot in self.remote_query(&DocumentQuery::new(collection)).await? {
                writes.push(WriteOperation::delete(snapshot.path().clone()));
            }
        }
        writes.push(WriteOperation::delete(schema::user(player_id)?));
        self.remote_commit(writes).await?;

        let purged = self
            .queue()
            .purge_where(|operation| operation.path.starts_with(&[schema::USERS, player_id]));
        if self.is_listening_to(player_id) {
            self.stop_listening();
        }
        self.purge_player_cache(player_id);
        LOGGER.info(format!(
            "deleted account {player_id} ({purged} pending operations discarded)"
        ));
        Ok(())
    }
}

/// `users/{id}` paths name a profile; anything else does not.
fn profile_owner(path: &DocumentPath) -> Option<String> {
    match path.segments() {
        [collection, player_id] if collection == schema::USERS => Some(player_id.clone()),
        _ => None,
    }
}

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, Utc};

use crate::analytics::MetricEvent;
use crate::cache::keys;
use crate::error::{
    conflict, invalid_score, not_found, remote_unavailable, too_frequent, RunnerResult,
    RunnerErrorCode,
};
use crate::identity::{require_user, IdentityArc};
use crate::leaderboard::entry::{
    LeaderboardEntry, LeaderboardEvent, ScoreSubmission, SubmissionReceipt,
};
use crate::leaderboard::partition::PartitionKey;
use crate::leaderboard::ranking::{player_ranks, rank_changes, rank_entries, window_around};
use crate::leaderboard::settings::LeaderboardSettings;
use crate::leaderboard::tournament::{JoinOutcome, Tournament};
use crate::logger::Logger;
use crate::remote::{
    encode_document, schema, CollectionPath, DocumentQuery, DocumentSnapshot, FilterOperator,
    OrderDirection, Precondition, WriteOperation,
};
use crate::sync::{ManagedCollection, ProfileMutation, SyncEngine};
use crate::util::{next_id, EventBus, Subscription};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@runner/leaderboard"));

/// Values one `In` filter may carry.
const MAX_IN_VALUES: usize = 30;

/// One remote read feeding a partition snapshot. `members` is the slice of a friends circle the
/// query covers, empty for boards that own their rows.
struct SnapshotSource {
    query: DocumentQuery,
    members: Vec<String>,
}

/// Score submission, partition snapshots and tournament membership.
///
/// Ranks are never computed from a full partition. Each refresh pulls the top rows of a partition
/// ordered by score, ranks them locally, and compares against the previous snapshot to report
/// rank movements.
#[derive(Clone)]
pub struct LeaderboardEngine {
    inner: Arc<LeaderboardInner>,
}

struct LeaderboardInner {
    sync: SyncEngine,
    identity: IdentityArc,
    settings: LeaderboardSettings,
    events: EventBus<LeaderboardEvent>,
    last_submission: Mutex<HashMap<String, DateTime<Utc>>>,
    tracked: Mutex<BTreeSet<PartitionKey>>,
    listeners: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl std::fmt::Debug for LeaderboardEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderboardEngine")
            .field("tracked", &self.inner.tracked.lock().unwrap().len())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl LeaderboardEngine {
    pub fn new(sync: SyncEngine, identity: IdentityArc, settings: LeaderboardSettings) -> Self {
        Self {
            inner: Arc::new(LeaderboardInner {
                sync,
                identity,
                settings,
                events: EventBus::new(),
                last_submission: Mutex::new(HashMap::new()),
                tracked: Mutex::new(BTreeSet::new()),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn sync(&self) -> &SyncEngine {
        &self.inner.sync
    }

    pub fn settings(&self) -> &LeaderboardSettings {
        &self.inner.settings
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LeaderboardEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn events(&self) -> async_channel::Receiver<LeaderboardEvent> {
        self.inner.events.channel()
    }

    /// Partitions refreshed by [`LeaderboardEngine::run_ranking_pass`].
    pub fn tracked_partitions(&self) -> Vec<PartitionKey> {
        self.inner.tracked.lock().unwrap().iter().cloned().collect()
    }

    fn track(&self, key: &PartitionKey) {
        self.inner.tracked.lock().unwrap().insert(key.clone());
    }

    // ---- submission ----------------------------------------------------------------------

    /// Runs the submission pipeline: session, anti-spam floor, bounds, partition fan-out,
    /// personal best, then one write-through batch.
    ///
    /// The friends board is listed in the receipt but not written: every circle reads the global
    /// rows of its members, so a score costs the same number of writes however many friends
    /// the player has.
    pub async fn submit_score(&self, submission: ScoreSubmission) -> RunnerResult<SubmissionReceipt> {
        let player_id = require_user(self.inner.identity.as_ref())?;
        let _guard = self
            .sync()
            .lock_resource(&format!("submit:{player_id}"))
            .await;
        let now = self.sync().now();
        self.check_throttle(&player_id, now)?;
        self.validate_submission(&submission)?;

        let bot = self
            .sync()
            .cached_bots(&player_id)
            .into_iter()
            .find(|bot| bot.bot_id == submission.bot_used);
        let mut partitions = PartitionKey::time_partitions(now);
        partitions.push(PartitionKey::bot(&submission.bot_used)?);
        for tournament in self.active_memberships(&player_id, now) {
            if tournament.rules.admits(bot.as_ref()) {
                partitions.push(PartitionKey::tournament(&tournament.tournament_id)?);
            } else {
                LOGGER.debug(format!(
                    "{} does not meet the rules of {}",
                    submission.bot_used, tournament.tournament_id
                ));
            }
        }

        let entry_id = next_id(self.sync().clock().now_millis());
        let score = submission.score;
        let bot_used = submission.bot_used.clone();

        let ProfileMutation {
            value: (entries, previous_best, improved),
            outcome,
            ..
        } = self
            .sync()
            .update_profile_with(&player_id, |profile, writes| {
                if !profile.friend_ids.is_empty() {
                    partitions.push(PartitionKey::friends(&profile.player_id)?);
                }

                let previous_best =
                    (profile.stats.total_runs > 0).then_some(profile.stats.best_score);
                let improved = previous_best.map_or(true, |best| score > best);
                profile.stats.total_runs += 1;
                if improved {
                    profile.stats.best_score = score;
                }

                let mut entries = Vec::with_capacity(partitions.len());
                for key in partitions {
                    let entry = LeaderboardEntry {
                        entry_id: entry_id.clone(),
                        player_id: profile.player_id.clone(),
                        display_name: profile.display_name.clone(),
                        score,
                        achieved_at: now,
                        bot_used: bot_used.clone(),
                        leaderboard_type: key.board(),
                        partition_id: key.id(),
                        rank: None,
                    };
                    if !key.is_derived() {
                        writes.push(WriteOperation::create(
                            key.entries()?.doc(&entry_id)?,
                            encode_document(&entry)?,
                        ));
                    }
                    entries.push((key, entry));
                }
                Ok((entries, previous_best, improved))
            })
            .await?;

        self.inner
            .last_submission
            .lock()
            .unwrap()
            .insert(player_id.clone(), now);
        for (key, entry) in &entries {
            self.insert_local_entry(key, entry.clone());
        }

        if improved {
            self.inner.events.publish(LeaderboardEvent::NewHighScore {
                player_id: player_id.clone(),
                score,
                previous: previous_best,
            });
            self.sync()
                .analytics()
                .log_event(&MetricEvent::NewHighScore {
                    score,
                    previous: previous_best,
                });
        }
        self.sync()
            .analytics()
            .log_event(&MetricEvent::ScoreSubmitted {
                score,
                bot_used: submission.bot_used,
                partitions: entries.len(),
                queued: outcome.is_queued(),
            });
        LOGGER.debug(format!(
            "score {score} for {player_id} written to {} partitions ({outcome:?})",
            entries.len()
        ));

        Ok(SubmissionReceipt {
            entry_id,
            partitions: entries.iter().map(|(key, _)| key.id()).collect(),
            outcome,
            new_high_score: improved,
            previous_best,
        })
    }

    fn check_throttle(&self, player_id: &str, now: DateTime<Utc>) -> RunnerResult<()> {
        let interval =
            chrono::Duration::milliseconds(self.inner.settings.min_submit_interval_millis as i64);
        let last = self
            .inner
            .last_submission
            .lock()
            .unwrap()
            .get(player_id)
            .copied();
        match last {
            Some(last) if now - last < interval => {
                let wait = (interval - (now - last)).num_milliseconds();
                Err(too_frequent(format!(
                    "scores are limited to one every {}ms; retry in {wait}ms",
                    interval.num_milliseconds()
                )))
            }
            _ => Ok(()),
        }
    }

    fn validate_submission(&self, submission: &ScoreSubmission) -> RunnerResult<()> {
        let ceiling = self.inner.settings.score_ceiling;
        if submission.score < 0 || submission.score > ceiling {
            return Err(invalid_score(format!(
                "score {} is outside 0..={ceiling}",
                submission.score
            )));
        }
        if submission.bot_used.trim().is_empty() || submission.bot_used.contains('/') {
            return Err(invalid_score("a score must name the bot that achieved it"));
        }
        Ok(())
    }

    /// Shows a just-submitted score in the cached snapshot before the next ranking pass.
    fn insert_local_entry(&self, key: &PartitionKey, entry: LeaderboardEntry) {
        let mut rows = self.cached_snapshot(key).unwrap_or_default();
        rows.retain(|row| row.entry_id != entry.entry_id);
        rows.push(entry);
        let mut ranked = rank_entries(rows);
        ranked.truncate(self.inner.settings.snapshot_size);
        self.sync().store_cached(&key.cache_key(), &ranked, 0, None);
    }

    // ---- snapshots -----------------------------------------------------------------------

    /// Top rows by score; equal scores keep the earlier achievement so the cut at the snapshot
    /// size agrees with local ranking.
    fn ranked_query(&self, collection: CollectionPath) -> DocumentQuery {
        DocumentQuery::new(collection)
            .order_by("score", OrderDirection::Descending)
            .order_by("achievedAt", OrderDirection::Ascending)
            .limit(self.inner.settings.snapshot_size)
    }

    /// The owner followed by their cached friends. Without a cached profile only the owner is
    /// known.
    fn friend_circle(&self, owner_id: &str) -> Vec<String> {
        let mut members = vec![owner_id.to_string()];
        if let Some(profile) = self.sync().cached_profile(owner_id) {
            members.extend(profile.friend_ids.into_iter().filter(|id| id != owner_id));
        }
        members
    }

    fn snapshot_sources(&self, key: &PartitionKey) -> RunnerResult<Vec<SnapshotSource>> {
        let collection = key.source_entries()?;
        if !key.is_derived() {
            return Ok(vec![SnapshotSource {
                query: self.ranked_query(collection),
                members: Vec::new(),
            }]);
        }
        Ok(self
            .friend_circle(key.scope())
            .chunks(MAX_IN_VALUES)
            .map(|chunk| SnapshotSource {
                query: self.ranked_query(collection.clone()).where_field(
                    "playerId",
                    FilterOperator::In,
                    chunk.to_vec(),
                ),
                members: chunk.to_vec(),
            })
            .collect())
    }

    async fn fetch_partition(&self, key: &PartitionKey) -> RunnerResult<Vec<DocumentSnapshot>> {
        let mut snapshots = Vec::new();
        for source in self.snapshot_sources(key)? {
            snapshots.extend(self.sync().remote_query(&source.query).await?);
        }
        Ok(snapshots)
    }

    pub fn cached_snapshot(&self, key: &PartitionKey) -> Option<Vec<LeaderboardEntry>> {
        self.sync()
            .read_cached::<Vec<LeaderboardEntry>>(&key.cache_key())
            .map(|blob| blob.value)
    }

    /// Pulls the top rows of `key`, ranks them and caches the result. Falls back to the cached
    /// snapshot when the remote store is unreachable.
    pub async fn refresh_partition(&self, key: &PartitionKey) -> RunnerResult<Vec<LeaderboardEntry>> {
        self.track(key);
        let _guard = self.sync().lock_resource(&key.cache_key()).await;
        self.sync().begin_sync(ManagedCollection::LeaderboardSnapshot);

        let result = match self.fetch_partition(key).await {
            Ok(snapshots) => {
                let entries = self.decode_entries(key, &snapshots);
                Ok((self.apply_snapshot(key, entries), false))
            }
            Err(err) if err.is_retriable() => {
                LOGGER.info(format!("partition {key} served from cache: {err}"));
                Ok((self.cached_snapshot(key).unwrap_or_default(), true))
            }
            Err(err) => Err(err),
        };

        let stale = !matches!(result, Ok((_, false)));
        self.sync()
            .finish_sync(ManagedCollection::LeaderboardSnapshot, stale);
        result.map(|(rows, _)| rows)
    }

    /// Remote rows plus local rows whose creation is still queued.
    fn decode_entries(&self, key: &PartitionKey, snapshots: &[DocumentSnapshot]) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = snapshots
            .iter()
            .filter_map(|snapshot| match snapshot.decode::<LeaderboardEntry>() {
                Ok(entry) => entry,
                Err(err) => {
                    LOGGER.warn(format!("skipping leaderboard row: {err}"));
                    None
                }
            })
            .map(|mut entry| {
                if key.is_derived() {
                    entry.leaderboard_type = key.board();
                    entry.partition_id = key.id();
                }
                entry
            })
            .collect();

        let Ok(collection) = key.source_entries() else {
            return entries;
        };
        let queue = self.sync().queue();
        for local in self.cached_snapshot(key).unwrap_or_default() {
            let pending = collection
                .doc(&local.entry_id)
                .map(|path| queue.has_pending_for(&path))
                .unwrap_or(false);
            if pending && !entries.iter().any(|entry| entry.entry_id == local.entry_id) {
                entries.push(local);
            }
        }
        entries
    }

    fn apply_snapshot(&self, key: &PartitionKey, entries: Vec<LeaderboardEntry>) -> Vec<LeaderboardEntry> {
        let mut ranked = rank_entries(entries);
        ranked.truncate(self.inner.settings.snapshot_size);

        let previous = self.cached_snapshot(key);
        let now = self.sync().now();
        self.sync()
            .store_cached(&key.cache_key(), &ranked, 0, Some(now));

        let partition_id = key.id();
        if let Some(previous) = previous {
            let current_player = self.inner.identity.current_user_id();
            for change in rank_changes(&player_ranks(&previous), &player_ranks(&ranked)) {
                if current_player.as_deref() == Some(change.player_id.as_str()) {
                    self.sync()
                        .analytics()
                        .log_event(&MetricEvent::RankChanged {
                            partition_id: partition_id.clone(),
                            previous_rank: change.previous,
                            new_rank: change.current,
                        });
                }
                self.inner.events.publish(LeaderboardEvent::RankChanged {
                    partition_id: partition_id.clone(),
                    player_id: change.player_id,
                    previous_rank: change.previous,
                    new_rank: change.current,
                });
            }
        }
        self.inner.events.publish(LeaderboardEvent::SnapshotUpdated {
            partition_id,
            entries: ranked.len(),
        });
        ranked
    }

    /// Re-pulls every tracked partition. Partitions from elapsed time buckets are dropped first.
    pub async fn run_ranking_pass(&self) -> usize {
        if !self.sync().is_online() {
            return 0;
        }
        let current = PartitionKey::time_partitions(self.sync().now());
        let keys: Vec<PartitionKey> = {
            let mut tracked = self.inner.tracked.lock().unwrap();
            tracked.retain(|key| !key.board().is_time_bucketed() || current.contains(key));
            tracked.iter().cloned().collect()
        };

        let mut refreshed = 0;
        for key in keys {
            match self.refresh_partition(&key).await {
                Ok(_) => refreshed += 1,
                Err(err) => LOGGER.warn(format!("ranking pass skipped {key}: {err}")),
            }
        }
        refreshed
    }

    pub async fn top(&self, key: &PartitionKey, limit: usize) -> RunnerResult<Vec<LeaderboardEntry>> {
        let rows = self.snapshot_or_refresh(key).await?;
        Ok(rows.into_iter().take(limit).collect())
    }

    pub async fn rows_around_player(
        &self,
        key: &PartitionKey,
        player_id: &str,
        radius: usize,
    ) -> RunnerResult<Vec<LeaderboardEntry>> {
        let rows = self.snapshot_or_refresh(key).await?;
        Ok(window_around(&rows, player_id, radius))
    }

    /// Rank of the player's best row, if it is inside the snapshot.
    pub async fn player_rank(&self, key: &PartitionKey, player_id: &str) -> RunnerResult<Option<u32>> {
        let rows = self.snapshot_or_refresh(key).await?;
        Ok(player_ranks(&rows).get(player_id).copied())
    }

    async fn snapshot_or_refresh(&self, key: &PartitionKey) -> RunnerResult<Vec<LeaderboardEntry>> {
        match self.cached_snapshot(key) {
            Some(rows) => {
                self.track(key);
                Ok(rows)
            }
            None => self.refresh_partition(key).await,
        }
    }

    /// Keeps the cached snapshot of `key` current from remote pushes.
    ///
    /// A friends circle too large for one query gets one listener per chunk; each push replaces
    /// the rows of its own chunk and keeps the cached rows of the others.
    pub fn listen_partition(&self, key: &PartitionKey) -> RunnerResult<()> {
        let sources = self.snapshot_sources(key)?;
        let chunked = sources.len() > 1;
        let mut subscriptions = Vec::with_capacity(sources.len());
        for source in sources {
            let weak = Arc::downgrade(&self.inner);
            let partition = key.clone();
            let members = if chunked { source.members } else { Vec::new() };
            subscriptions.push(self.sync().listen_query(
                &source.query,
                Arc::new(move |snapshots: &[DocumentSnapshot]| {
                    if let Some(inner) = weak.upgrade() {
                        let engine = LeaderboardEngine { inner };
                        let mut entries = engine.decode_entries(&partition, snapshots);
                        if !members.is_empty() {
                            let others: Vec<LeaderboardEntry> = engine
                                .cached_snapshot(&partition)
                                .unwrap_or_default()
                                .into_iter()
                                .filter(|row| {
                                    !members.contains(&row.player_id)
                                        && !entries.iter().any(|entry| entry.entry_id == row.entry_id)
                                })
                                .collect();
                            entries.extend(others);
                        }
                        engine.apply_snapshot(&partition, entries);
                    }
                }),
            )?);
        }
        self.track(key);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .insert(key.id(), subscriptions);
        Ok(())
    }

    pub fn stop_listening(&self, key: &PartitionKey) {
        let removed = self.inner.listeners.lock().unwrap().remove(&key.id());
        drop(removed);
    }

    pub fn stop_all_listeners(&self) {
        let removed: Vec<Subscription> = self
            .inner
            .listeners
            .lock()
            .unwrap()
            .drain()
            .flat_map(|(_, subscriptions)| subscriptions)
            .collect();
        drop(removed);
    }

    // ---- tournaments ---------------------------------------------------------------------

    fn memberships(&self, player_id: &str) -> BTreeSet<String> {
        self.sync()
            .read_cached::<BTreeSet<String>>(&keys::memberships(player_id))
            .map(|blob| blob.value)
            .unwrap_or_default()
    }

    fn remember_tournament(&self, tournament: &Tournament) {
        let now = self.sync().now();
        self.sync().store_cached(
            &keys::tournament(&tournament.tournament_id),
            tournament,
            0,
            Some(now),
        );
        let Some(player_id) = self.inner.identity.current_user_id() else {
            return;
        };
        let mut memberships = self.memberships(&player_id);
        let changed = if tournament.is_member(&player_id) {
            memberships.insert(tournament.tournament_id.clone())
        } else {
            memberships.remove(&tournament.tournament_id)
        };
        if changed {
            self.sync()
                .store_cached(&keys::memberships(&player_id), &memberships, 0, Some(now));
        }
    }

    /// Cached tournaments the player belongs to that are running at `now`.
    pub fn active_memberships(&self, player_id: &str, now: DateTime<Utc>) -> Vec<Tournament> {
        self.memberships(player_id)
            .iter()
            .filter_map(|id| {
                self.sync()
                    .read_cached::<Tournament>(&keys::tournament(id))
                    .map(|blob| blob.value)
            })
            .filter(|tournament| tournament.is_member(player_id) && tournament.is_active(now))
            .collect()
    }

    pub async fn load_tournament(&self, tournament_id: &str) -> RunnerResult<Tournament> {
        let path = schema::tournament(tournament_id)?;
        match self.sync().remote_get(&path).await {
            Ok(snapshot) => match snapshot.decode::<Tournament>()? {
                Some(tournament) => {
                    self.remember_tournament(&tournament);
                    Ok(tournament)
                }
                None => Err(not_found(format!("tournament {tournament_id} does not exist"))),
            },
            Err(err) if err.is_retriable() => self
                .sync()
                .read_cached::<Tournament>(&keys::tournament(tournament_id))
                .map(|blob| blob.value)
                .ok_or(err),
            Err(err) => Err(err),
        }
    }

    /// Tournaments running now. Offline, only the player's cached memberships are known.
    pub async fn active_tournaments(&self) -> RunnerResult<Vec<Tournament>> {
        let now = self.sync().now();
        let query = DocumentQuery::new(schema::tournaments()?);
        match self.sync().remote_query(&query).await {
            Ok(snapshots) => {
                let mut active = Vec::new();
                for snapshot in snapshots {
                    match snapshot.decode::<Tournament>() {
                        Ok(Some(tournament)) => {
                            self.remember_tournament(&tournament);
                            if tournament.is_active(now) {
                                active.push(tournament);
                            }
                        }
                        Ok(None) => {}
                        Err(err) => LOGGER.warn(format!("skipping tournament: {err}")),
                    }
                }
                Ok(active)
            }
            Err(err) if err.is_retriable() => match self.inner.identity.current_user_id() {
                Some(player_id) => Ok(self.active_memberships(&player_id, now)),
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Idempotent, capacity-checked join committed as an optimistic transaction.
    pub async fn join_tournament(&self, tournament_id: &str) -> RunnerResult<JoinOutcome> {
        let player_id = require_user(self.inner.identity.as_ref())?;
        let _guard = self
            .sync()
            .lock_resource(&keys::tournament(tournament_id))
            .await;
        if !self.sync().is_online() {
            return Err(remote_unavailable(
                "joining a tournament requires a connection",
            ));
        }
        let path = schema::tournament(tournament_id)?;

        for attempt in 1..=self.inner.settings.join_max_attempts {
            let snapshot = self.sync().remote_get(&path).await?;
            let Some(tournament) = snapshot.decode::<Tournament>()? else {
                return Err(not_found(format!("tournament {tournament_id} does not exist")));
            };

            if tournament.check_join(&player_id, self.sync().now())? == JoinOutcome::AlreadyMember {
                self.remember_tournament(&tournament);
                return Ok(JoinOutcome::AlreadyMember);
            }

            let mut joined = tournament;
            joined.participant_ids.insert(player_id.clone());
            let precondition = match snapshot.update_time() {
                Some(update_time) => Precondition::UpdateTime(update_time),
                None => Precondition::Exists(true),
            };
            let write = WriteOperation::set(path.clone(), encode_document(&joined)?)
                .with_precondition(precondition);

            match self.sync().remote_commit(vec![write]).await {
                Ok(_) => {
                    self.remember_tournament(&joined);
                    self.sync()
                        .analytics()
                        .log_event(&MetricEvent::TournamentJoined {
                            tournament_id: tournament_id.to_string(),
                        });
                    LOGGER.info(format!(
                        "{player_id} joined {tournament_id} ({}/{})",
                        joined.current_participants(),
                        joined.max_participants
                    ));
                    return Ok(JoinOutcome::Joined);
                }
                Err(err) if err.code == RunnerErrorCode::Conflict => {
                    LOGGER.debug(format!(
                        "join {tournament_id} lost a race (attempt {attempt}); retrying"
                    ));
                }
                Err(err) => return Err(err),
            }
        }

        Err(conflict(format!(
            "tournament {tournament_id} is under contention; try again"
        )))
    }
}

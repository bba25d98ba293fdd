use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::cache::{keys, LocalCache};
use crate::logger::Logger;
use crate::queue::operation::{OperationKind, QueuedOperation};
use crate::queue::settings::QueueSettings;
use crate::remote::DocumentPath;
use crate::util::{next_id, EventBus, Subscription};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@runner/queue"));

#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    /// The cap was exceeded and these operations were evicted, oldest first.
    Overflow { evicted: Vec<QueuedOperation> },
    /// An operation exhausted its retries and was removed without being applied.
    Dropped { operation: QueuedOperation },
}

#[derive(Clone, Debug, PartialEq)]
pub enum NackOutcome {
    Rescheduled {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    Dropped,
    /// The id was not (or no longer) queued.
    Unknown,
}

/// Durable FIFO of pending remote mutations, persisted under the `opqueue` cache key.
///
/// Operations targeting the same document leave in the order they were enqueued: while an earlier
/// operation for a key is backing off, later operations for that key are held back too.
pub struct OperationQueue {
    cache: Arc<LocalCache>,
    settings: QueueSettings,
    entries: Mutex<VecDeque<QueuedOperation>>,
    events: EventBus<QueueEvent>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("len", &self.size())
            .field("max_len", &self.settings.max_len)
            .finish()
    }
}

impl OperationQueue {
    /// Restores whatever was pending when the process last stopped.
    pub fn open(cache: Arc<LocalCache>, settings: QueueSettings) -> Self {
        let restored: VecDeque<QueuedOperation> = cache
            .read::<Vec<QueuedOperation>>(keys::OPERATION_QUEUE)
            .unwrap_or_default()
            .into();
        if !restored.is_empty() {
            LOGGER.info(format!("restored {} pending operations", restored.len()));
        }
        Self {
            cache,
            settings,
            entries: Mutex::new(restored),
            events: EventBus::new(),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Appends an operation and returns its id.
    pub fn enqueue(&self, path: DocumentPath, kind: OperationKind, now: DateTime<Utc>) -> String {
        self.enqueue_with_deltas(path, kind, BTreeMap::new(), now)
    }

    /// Appends an operation whose patch on `path` moved the given counters.
    pub fn enqueue_with_deltas(
        &self,
        path: DocumentPath,
        kind: OperationKind,
        deltas: BTreeMap<String, i64>,
        now: DateTime<Utc>,
    ) -> String {
        let operation = QueuedOperation {
            id: next_id(now.timestamp_millis().max(0) as u64),
            path,
            kind,
            created_at: now,
            retry_count: 0,
            not_before: None,
            deltas,
        };
        let id = operation.id.clone();

        let evicted = {
            let mut entries = self.entries.lock().unwrap();
            entries.push_back(operation);
            let mut evicted = Vec::new();
            while entries.len() > self.settings.max_len {
                if let Some(oldest) = entries.pop_front() {
                    evicted.push(oldest);
                }
            }
            self.persist(&entries);
            evicted
        };

        LOGGER.debug(format!("queued operation {id}"));
        if !evicted.is_empty() {
            LOGGER.warn(format!(
                "operation queue over capacity ({}), evicted {} oldest entries",
                self.settings.max_len,
                evicted.len()
            ));
            self.events.publish(QueueEvent::Overflow { evicted });
        }
        id
    }

    /// Up to `limit` ready operations in FIFO order, respecting per-key ordering.
    pub fn peek_batch(&self, limit: usize, now: DateTime<Utc>) -> Vec<QueuedOperation> {
        let entries = self.entries.lock().unwrap();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut batch = Vec::new();
        for operation in entries.iter() {
            if batch.len() >= limit {
                break;
            }
            let key = operation.key();
            if blocked.contains(&key) {
                continue;
            }
            if !operation.is_ready(now) {
                blocked.insert(key);
                continue;
            }
            batch.push(operation.clone());
        }
        batch
    }

    /// Removes an applied operation. Returns false when the id is unknown.
    pub fn ack(&self, operation_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|operation| operation.id != operation_id);
        let removed = entries.len() != before;
        if removed {
            self.persist(&entries);
        }
        removed
    }

    /// Records a failed attempt: reschedules with exponential backoff, or drops the operation once
    /// it has used up its retries.
    pub fn nack(&self, operation_id: &str, now: DateTime<Utc>) -> NackOutcome {
        let (outcome, dropped) = {
            let mut entries = self.entries.lock().unwrap();
            let Some(index) = entries
                .iter()
                .position(|operation| operation.id == operation_id)
            else {
                return NackOutcome::Unknown;
            };

            let attempt = entries[index].retry_count + 1;
            if attempt > self.settings.max_retries {
                let dropped = entries.remove(index);
                self.persist(&entries);
                (NackOutcome::Dropped, dropped)
            } else {
                let delay = self.settings.backoff.delay_millis(attempt);
                let retry_at = now + Duration::milliseconds(delay as i64);
                let operation = &mut entries[index];
                operation.retry_count = attempt;
                operation.not_before = Some(retry_at);
                self.persist(&entries);
                (NackOutcome::Rescheduled { attempt, retry_at }, None)
            }
        };

        if let Some(operation) = dropped {
            LOGGER.warn(format!(
                "dropping operation {} on {} after {} attempts",
                operation.id, operation.path, operation.retry_count
            ));
            self.events.publish(QueueEvent::Dropped { operation });
        }
        outcome
    }

    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn get(&self, operation_id: &str) -> Option<QueuedOperation> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|operation| operation.id == operation_id)
            .cloned()
    }

    /// Whether any queued operation, batched writes included, still has to write `path`.
    pub fn has_pending_for(&self, path: &DocumentPath) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|operation| operation.touches(path))
    }

    /// Rewrites, in FIFO order, every operation keyed on `path`. Returns how many were visited.
    pub fn rewrite_for<F>(&self, path: &DocumentPath, mut rewrite: F) -> usize
    where
        F: FnMut(&mut QueuedOperation),
    {
        let mut entries = self.entries.lock().unwrap();
        let mut visited = 0;
        for operation in entries.iter_mut().filter(|operation| &operation.path == path) {
            rewrite(operation);
            visited += 1;
        }
        if visited > 0 {
            self.persist(&entries);
        }
        visited
    }

    /// Removes every operation matching `predicate`, returning how many were removed.
    pub fn purge_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&QueuedOperation) -> bool,
    {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|operation| !predicate(operation));
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries);
        }
        removed
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.clear();
        self.persist(&entries);
    }

    fn persist(&self, entries: &VecDeque<QueuedOperation>) {
        let rows: Vec<&QueuedOperation> = entries.iter().collect();
        if let Err(err) = self.cache.write(keys::OPERATION_QUEUE, &rows) {
            LOGGER.warn(format!("operation queue kept in memory only: {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::util::BackoffConfig;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    fn path(value: &str) -> DocumentPath {
        DocumentPath::from_string(value).unwrap()
    }

    fn set(value: serde_json::Value) -> OperationKind {
        OperationKind::Set {
            data: value.as_object().cloned().unwrap(),
            merge: true,
        }
    }

    fn queue_with(settings: QueueSettings) -> (Arc<LocalCache>, OperationQueue) {
        let cache = Arc::new(LocalCache::new(Arc::new(InMemoryCacheStore::new())));
        let queue = OperationQueue::open(Arc::clone(&cache), settings);
        (cache, queue)
    }

    #[test]
    fn fifo_and_ack() {
        let (_, queue) = queue_with(QueueSettings::default());
        let first = queue.enqueue(path("users/p1"), set(json!({"level": 2})), now());
        let second = queue.enqueue(path("users/p2"), OperationKind::Delete, now());

        let batch = queue.peek_batch(10, now());
        let ids: Vec<_> = batch.iter().map(|op| op.id.clone()).collect();
        assert_eq!(ids, [first.clone(), second]);

        assert!(queue.ack(&first));
        assert!(!queue.ack(&first));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn survives_reopen() {
        let (cache, queue) = queue_with(QueueSettings::default());
        queue.enqueue(path("users/p1"), set(json!({"level": 2})), now());
        queue.enqueue(path("users/p1"), set(json!({"level": 3})), now());
        drop(queue);

        let reopened = OperationQueue::open(cache, QueueSettings::default());
        assert_eq!(reopened.size(), 2);
        assert_eq!(reopened.peek_batch(1, now())[0].kind, set(json!({"level": 2})));
    }

    #[test]
    fn backing_off_operation_holds_back_same_key() {
        let (_, queue) = queue_with(QueueSettings::default());
        let first = queue.enqueue(path("users/p1"), set(json!({"a": 1})), now());
        queue.enqueue(path("users/p1"), set(json!({"b": 1})), now());
        let other = queue.enqueue(path("users/p2"), set(json!({"c": 1})), now());

        match queue.nack(&first, now()) {
            NackOutcome::Rescheduled { attempt, retry_at } => {
                assert_eq!(attempt, 1);
                assert!(retry_at > now());
            }
            outcome => panic!("unexpected {outcome:?}"),
        }

        let batch = queue.peek_batch(10, now());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, other);

        let later = now() + Duration::minutes(30);
        assert_eq!(queue.peek_batch(10, later).len(), 3);
    }

    #[test]
    fn drops_after_max_retries() {
        let settings = QueueSettings {
            max_retries: 1,
            backoff: BackoffConfig {
                initial_delay_millis: 10,
                ..BackoffConfig::default()
            },
            ..QueueSettings::default()
        };
        let (_, queue) = queue_with(settings);
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dropped);
        let _subscription = queue.subscribe(move |event| {
            if let QueueEvent::Dropped { operation } = event {
                sink.lock().unwrap().push(operation.id.clone());
            }
        });

        let id = queue.enqueue(path("users/p1"), OperationKind::Delete, now());
        assert!(matches!(queue.nack(&id, now()), NackOutcome::Rescheduled { .. }));
        assert_eq!(queue.nack(&id, now()), NackOutcome::Dropped);
        assert!(queue.is_empty());
        assert_eq!(dropped.lock().unwrap().as_slice(), &[id]);
        assert_eq!(queue.nack("missing", now()), NackOutcome::Unknown);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let settings = QueueSettings {
            max_len: 2,
            ..QueueSettings::default()
        };
        let (_, queue) = queue_with(settings);
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let _subscription = queue.subscribe(move |event| {
            if let QueueEvent::Overflow { evicted } = event {
                sink.lock()
                    .unwrap()
                    .extend(evicted.iter().map(|op| op.id.clone()));
            }
        });

        let oldest = queue.enqueue(path("users/p1"), OperationKind::Delete, now());
        queue.enqueue(path("users/p2"), OperationKind::Delete, now());
        queue.enqueue(path("users/p3"), OperationKind::Delete, now());

        assert_eq!(queue.size(), 2);
        assert_eq!(evicted.lock().unwrap().as_slice(), &[oldest]);
        assert!(!queue.has_pending_for(&path("users/p1")));
    }

    #[test]
    fn batched_paths_count_as_pending() {
        let (_, queue) = queue_with(QueueSettings::default());
        let writes = vec![
            crate::remote::WriteOperation::merge(path("users/p1"), json!({"level": 2}).as_object().cloned().unwrap()),
            crate::remote::WriteOperation::create(path("users/p1/purchases/t1"), Default::default()),
        ];
        let (primary, kind) = OperationKind::from_writes(&writes).unwrap();
        let id = queue.enqueue(primary, kind, now());

        assert!(queue.has_pending_for(&path("users/p1/purchases/t1")));
        assert_eq!(queue.get(&id).unwrap().to_writes(), writes);
        assert!(queue.get("missing").is_none());
    }

    #[test]
    fn rewrite_touches_only_operations_on_the_path() {
        let (cache, queue) = queue_with(QueueSettings::default());
        queue.enqueue(path("users/p1"), set(json!({"level": 2})), now());
        queue.enqueue(path("users/p2"), set(json!({"level": 2})), now());
        let visited = queue.rewrite_for(&path("users/p1"), |operation| {
            if let Some(patch) = operation.patch_mut() {
                patch.insert("level".into(), json!(9));
            }
        });
        assert_eq!(visited, 1);

        let reopened = OperationQueue::open(cache, QueueSettings::default());
        let kinds: Vec<_> = reopened.snapshot().into_iter().map(|op| op.kind).collect();
        assert_eq!(kinds, [set(json!({"level": 9})), set(json!({"level": 2}))]);
    }

    #[test]
    fn purge_matching_player() {
        let (_, queue) = queue_with(QueueSettings::default());
        queue.enqueue(path("users/p1"), OperationKind::Delete, now());
        queue.enqueue(path("users/p1/bots/b1"), OperationKind::Delete, now());
        queue.enqueue(path("users/p2"), OperationKind::Delete, now());
        assert_eq!(queue.purge_where(|op| op.path.starts_with(&["users", "p1"])), 2);
        assert_eq!(queue.size(), 1);
    }
}

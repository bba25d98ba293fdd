use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{conflict, internal_error, remote_unavailable, RunnerResult};
use crate::platform::runtime::sleep;
use crate::remote::datastore::{
    CommitResult, DocumentListener, Precondition, QueryListener, RemoteDocumentStore,
    WriteOperation,
};
use crate::remote::path::{CollectionPath, DocumentPath};
use crate::remote::query::DocumentQuery;
use crate::remote::snapshot::{merge_into, DocumentData, DocumentSnapshot};
use crate::util::{ClockArc, Subscription, SystemClock};

#[derive(Clone, Debug)]
struct StoredDocument {
    data: DocumentData,
    update_time: DateTime<Utc>,
}

/// Counters of billable operations, mirroring how the free tier meters usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub reads: u64,
    pub writes: u64,
    pub commits: u64,
}

struct Listeners {
    documents: Vec<(u64, DocumentPath, DocumentListener)>,
    queries: Vec<(u64, DocumentQuery, QueryListener)>,
}

struct StoreInner {
    clock: ClockArc,
    documents: Mutex<BTreeMap<DocumentPath, StoredDocument>>,
    last_update: Mutex<Option<DateTime<Utc>>>,
    listeners: Mutex<Listeners>,
    next_listener_id: AtomicU64,
    available: AtomicBool,
    failing_commits: AtomicUsize,
    rejecting_commits: AtomicUsize,
    latency: Mutex<Duration>,
    stats: Mutex<RemoteStats>,
}

/// Process-local document store with the same semantics as the cloud backend.
///
/// Used as the emulator in tests and as the backing store when the game runs without a backend.
/// `set_available(false)` makes every call fail with `RemoteUnavailable`.
#[derive(Clone)]
pub struct InMemoryRemoteStore {
    inner: Arc<StoreInner>,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for InMemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRemoteStore")
            .field("documents", &self.inner.documents.lock().unwrap().len())
            .field("available", &self.is_available())
            .finish()
    }
}

impl InMemoryRemoteStore {
    pub fn new(clock: ClockArc) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                clock,
                documents: Mutex::new(BTreeMap::new()),
                last_update: Mutex::new(None),
                listeners: Mutex::new(Listeners {
                    documents: Vec::new(),
                    queries: Vec::new(),
                }),
                next_listener_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
                failing_commits: AtomicUsize::new(0),
                rejecting_commits: AtomicUsize::new(0),
                latency: Mutex::new(Duration::ZERO),
                stats: Mutex::new(RemoteStats::default()),
            }),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Makes the next `count` commits fail with `RemoteUnavailable`.
    pub fn fail_next_commits(&self, count: usize) {
        self.inner.failing_commits.store(count, Ordering::SeqCst);
    }

    /// The next `count` commits fail with a non-retriable internal error.
    pub fn reject_next_commits(&self, count: usize) {
        self.inner.rejecting_commits.store(count, Ordering::SeqCst);
    }

    /// Delay applied before every call completes.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock().unwrap() = latency;
    }

    pub fn stats(&self) -> RemoteStats {
        *self.inner.stats.lock().unwrap()
    }

    pub fn document(&self, path: &DocumentPath) -> Option<DocumentData> {
        self.inner
            .documents
            .lock()
            .unwrap()
            .get(path)
            .map(|stored| stored.data.clone())
    }

    pub fn documents_in(&self, collection: &CollectionPath) -> Vec<DocumentSnapshot> {
        self.inner
            .documents
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.is_child_of(collection))
            .map(|(path, stored)| {
                DocumentSnapshot::new(path.clone(), Some(stored.data.clone()), Some(stored.update_time))
            })
            .collect()
    }

    /// Writes a document directly, bypassing availability and metering. Listeners still fire.
    pub fn seed(&self, path: DocumentPath, data: DocumentData) {
        let update_time = self.next_update_time();
        self.inner
            .documents
            .lock()
            .unwrap()
            .insert(path.clone(), StoredDocument { data, update_time });
        self.notify(&[path]);
    }

    fn next_update_time(&self) -> DateTime<Utc> {
        let mut last = self.inner.last_update.lock().unwrap();
        let mut now = self.inner.clock.now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + chrono::Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    async fn enter(&self, label: &str) -> RunnerResult<()> {
        let latency = *self.inner.latency.lock().unwrap();
        sleep(latency).await;
        if !self.is_available() {
            return Err(remote_unavailable(format!("{label}: backend unreachable")));
        }
        Ok(())
    }

    fn snapshot_of(&self, path: &DocumentPath) -> DocumentSnapshot {
        match self.inner.documents.lock().unwrap().get(path) {
            Some(stored) => DocumentSnapshot::new(
                path.clone(),
                Some(stored.data.clone()),
                Some(stored.update_time),
            ),
            None => DocumentSnapshot::missing(path.clone()),
        }
    }

    fn evaluate(&self, query: &DocumentQuery) -> Vec<DocumentSnapshot> {
        query.apply(self.documents_in(query.collection()))
    }

    fn notify(&self, changed: &[DocumentPath]) {
        let (documents, queries) = {
            let listeners = self.inner.listeners.lock().unwrap();
            let documents: Vec<(DocumentPath, DocumentListener)> = listeners
                .documents
                .iter()
                .filter(|(_, path, _)| changed.contains(path))
                .map(|(_, path, listener)| (path.clone(), Arc::clone(listener)))
                .collect();
            let queries: Vec<(DocumentQuery, QueryListener)> = listeners
                .queries
                .iter()
                .filter(|(_, query, _)| {
                    changed.iter().any(|path| path.is_child_of(query.collection()))
                })
                .map(|(_, query, listener)| (query.clone(), Arc::clone(listener)))
                .collect();
            (documents, queries)
        };

        for (path, listener) in documents {
            listener(&self.snapshot_of(&path));
        }
        for (query, listener) in queries {
            listener(&self.evaluate(&query));
        }
    }

    fn check_precondition(
        current: Option<&StoredDocument>,
        path: &DocumentPath,
        precondition: Precondition,
    ) -> RunnerResult<()> {
        match precondition {
            Precondition::None => Ok(()),
            Precondition::Exists(true) if current.is_none() => {
                Err(conflict(format!("{path} does not exist")))
            }
            Precondition::Exists(false) if current.is_some() => {
                Err(conflict(format!("{path} already exists")))
            }
            Precondition::Exists(_) => Ok(()),
            Precondition::UpdateTime(expected) => match current {
                Some(stored) if stored.update_time == expected => Ok(()),
                _ => Err(conflict(format!("{path} changed since it was read"))),
            },
        }
    }

    fn unsubscribe_with(&self, id: u64) -> Subscription {
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut listeners = inner.listeners.lock().unwrap();
                listeners.documents.retain(|(existing, _, _)| *existing != id);
                listeners.queries.retain(|(existing, _, _)| *existing != id);
            }
        })
    }
}

#[async_trait]
impl RemoteDocumentStore for InMemoryRemoteStore {
    async fn get(&self, path: &DocumentPath) -> RunnerResult<DocumentSnapshot> {
        self.enter(&format!("get {path}")).await?;
        self.inner.stats.lock().unwrap().reads += 1;
        Ok(self.snapshot_of(path))
    }

    async fn run_query(&self, query: &DocumentQuery) -> RunnerResult<Vec<DocumentSnapshot>> {
        self.enter(&format!("query {}", query.collection())).await?;
        let results = self.evaluate(query);
        self.inner.stats.lock().unwrap().reads += results.len().max(1) as u64;
        Ok(results)
    }

    async fn commit(&self, writes: Vec<WriteOperation>) -> RunnerResult<CommitResult> {
        self.enter("commit").await?;
        if take_one(&self.inner.failing_commits) {
            return Err(remote_unavailable("commit: injected failure"));
        }
        if take_one(&self.inner.rejecting_commits) {
            return Err(internal_error("commit: injected rejection"));
        }

        let commit_time = self.next_update_time();
        let mut changed = Vec::with_capacity(writes.len());
        {
            let mut documents = self.inner.documents.lock().unwrap();
            let mut working = documents.clone();
            for write in &writes {
                let path = write.path();
                Self::check_precondition(working.get(path), path, write.precondition())?;
                match write {
                    WriteOperation::Set {
                        path, data, merge, ..
                    } => {
                        let next = if *merge {
                            let mut base = working
                                .get(path)
                                .map(|existing| existing.data.clone())
                                .unwrap_or_default();
                            merge_into(&mut base, data);
                            base
                        } else {
                            data.clone()
                        };
                        working.insert(
                            path.clone(),
                            StoredDocument {
                                data: next,
                                update_time: commit_time,
                            },
                        );
                    }
                    WriteOperation::Delete { path, .. } => {
                        working.remove(path);
                    }
                }
                if !changed.contains(path) {
                    changed.push(path.clone());
                }
            }
            *documents = working;
        }

        {
            let mut stats = self.inner.stats.lock().unwrap();
            stats.commits += 1;
            stats.writes += writes.len() as u64;
        }
        self.notify(&changed);
        Ok(CommitResult { commit_time })
    }

    fn listen_document(
        &self,
        path: &DocumentPath,
        listener: DocumentListener,
    ) -> RunnerResult<Subscription> {
        if !self.is_available() {
            return Err(remote_unavailable(format!("listen {path}: backend unreachable")));
        }
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .documents
            .push((id, path.clone(), Arc::clone(&listener)));
        listener(&self.snapshot_of(path));
        Ok(self.unsubscribe_with(id))
    }

    fn listen_query(
        &self,
        query: &DocumentQuery,
        listener: QueryListener,
    ) -> RunnerResult<Subscription> {
        if !self.is_available() {
            return Err(remote_unavailable(format!(
                "listen {}: backend unreachable",
                query.collection()
            )));
        }
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .queries
            .push((id, query.clone(), Arc::clone(&listener)));
        listener(&self.evaluate(query));
        Ok(self.unsubscribe_with(id))
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
            remaining.checked_sub(1)
        })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::query::OrderDirection;
    use serde_json::json;

    fn data(value: serde_json::Value) -> DocumentData {
        value.as_object().cloned().unwrap()
    }

    fn path(value: &str) -> DocumentPath {
        DocumentPath::from_string(value).unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn commit_is_atomic_on_failed_precondition() {
        let store = InMemoryRemoteStore::default();
        store.seed(path("users/p1"), data(json!({"level": 1})));

        let err = store
            .commit(vec![
                WriteOperation::merge(path("users/p2"), data(json!({"level": 4}))),
                WriteOperation::create(path("users/p1"), data(json!({"level": 9}))),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "runner/conflict");
        assert!(store.document(&path("users/p2")).is_none());
        assert_eq!(store.document(&path("users/p1")).unwrap()["level"], 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn merge_and_update_time_precondition() {
        let store = InMemoryRemoteStore::default();
        store.seed(path("users/p1"), data(json!({"level": 1, "currencies": {"coins": 5}})));
        let snapshot = store.get(&path("users/p1")).await.unwrap();
        let stamp = snapshot.update_time().unwrap();

        store
            .commit(vec![WriteOperation::merge(
                path("users/p1"),
                data(json!({"currencies": {"gems": 2}})),
            )
            .with_precondition(Precondition::UpdateTime(stamp))])
            .await
            .unwrap();
        let stored = store.document(&path("users/p1")).unwrap();
        assert_eq!(serde_json::Value::Object(stored), json!({"level": 1, "currencies": {"coins": 5, "gems": 2}}));

        let stale = store
            .commit(vec![WriteOperation::delete(path("users/p1"))
                .with_precondition(Precondition::UpdateTime(stamp))])
            .await;
        assert!(stale.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unavailable_and_injected_failures() {
        let store = InMemoryRemoteStore::default();
        store.set_available(false);
        let err = store.get(&path("users/p1")).await.unwrap_err();
        assert!(err.is_retriable());

        store.set_available(true);
        store.fail_next_commits(1);
        assert!(store.commit(vec![WriteOperation::delete(path("users/p1"))]).await.is_err());
        assert!(store.commit(vec![WriteOperation::delete(path("users/p1"))]).await.is_ok());
        assert_eq!(store.stats().commits, 1);

        store.reject_next_commits(1);
        let err = store
            .commit(vec![WriteOperation::delete(path("users/p1"))])
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn listeners_receive_initial_and_changed_state() {
        let store = InMemoryRemoteStore::default();
        let collection = CollectionPath::from_string("leaderboards/global/entries").unwrap();
        let query = DocumentQuery::new(collection.clone()).order_by("score", OrderDirection::Descending);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = store
            .listen_query(
                &query,
                Arc::new(move |docs: &[DocumentSnapshot]| sink.lock().unwrap().push(docs.len())),
            )
            .unwrap();

        store
            .commit(vec![WriteOperation::set(
                collection.doc("e1").unwrap(),
                data(json!({"score": 10})),
            )])
            .await
            .unwrap();
        store
            .commit(vec![WriteOperation::set(path("users/p1"), data(json!({})))])
            .await
            .unwrap();
        drop(subscription);
        store
            .commit(vec![WriteOperation::set(
                collection.doc("e2").unwrap(),
                data(json!({"score": 20})),
            )])
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[0, 1]);
    }
}

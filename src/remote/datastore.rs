use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RunnerResult;
use crate::remote::path::DocumentPath;
use crate::remote::query::DocumentQuery;
use crate::remote::snapshot::{DocumentData, DocumentSnapshot};
use crate::util::Subscription;

/// Condition a write requires of the current remote document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    /// The document must still carry this update time (optimistic transactions).
    UpdateTime(DateTime<Utc>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOperation {
    Set {
        path: DocumentPath,
        data: DocumentData,
        merge: bool,
        precondition: Precondition,
    },
    Delete {
        path: DocumentPath,
        precondition: Precondition,
    },
}

impl WriteOperation {
    pub fn set(path: DocumentPath, data: DocumentData) -> Self {
        WriteOperation::Set {
            path,
            data,
            merge: false,
            precondition: Precondition::None,
        }
    }

    pub fn merge(path: DocumentPath, data: DocumentData) -> Self {
        WriteOperation::Set {
            path,
            data,
            merge: true,
            precondition: Precondition::None,
        }
    }

    pub fn create(path: DocumentPath, data: DocumentData) -> Self {
        WriteOperation::Set {
            path,
            data,
            merge: false,
            precondition: Precondition::Exists(false),
        }
    }

    pub fn delete(path: DocumentPath) -> Self {
        WriteOperation::Delete {
            path,
            precondition: Precondition::None,
        }
    }

    pub fn with_precondition(self, precondition: Precondition) -> Self {
        match self {
            WriteOperation::Set {
                path, data, merge, ..
            } => WriteOperation::Set {
                path,
                data,
                merge,
                precondition,
            },
            WriteOperation::Delete { path, .. } => WriteOperation::Delete { path, precondition },
        }
    }

    pub fn path(&self) -> &DocumentPath {
        match self {
            WriteOperation::Set { path, .. } | WriteOperation::Delete { path, .. } => path,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            WriteOperation::Set { precondition, .. }
            | WriteOperation::Delete { precondition, .. } => *precondition,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitResult {
    pub commit_time: DateTime<Utc>,
}

pub type DocumentListener = Arc<dyn Fn(&DocumentSnapshot) + Send + Sync + 'static>;
pub type QueryListener = Arc<dyn Fn(&[DocumentSnapshot]) + Send + Sync + 'static>;

/// Cloud document database as seen by the sync core.
///
/// `commit` is atomic: either every write applies or none does. A failed precondition surfaces as
/// `Conflict`; connectivity problems as `RemoteUnavailable`. Listeners receive the current state
/// once on registration and again after every change, in commit order.
#[async_trait]
pub trait RemoteDocumentStore: Send + Sync + 'static {
    async fn get(&self, path: &DocumentPath) -> RunnerResult<DocumentSnapshot>;

    async fn run_query(&self, query: &DocumentQuery) -> RunnerResult<Vec<DocumentSnapshot>>;

    async fn commit(&self, writes: Vec<WriteOperation>) -> RunnerResult<CommitResult>;

    fn listen_document(
        &self,
        path: &DocumentPath,
        listener: DocumentListener,
    ) -> RunnerResult<Subscription>;

    fn listen_query(
        &self,
        query: &DocumentQuery,
        listener: QueryListener,
    ) -> RunnerResult<Subscription>;
}

pub type RemoteStoreArc = Arc<dyn RemoteDocumentStore>;

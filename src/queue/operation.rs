use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::{DocumentData, DocumentPath, Precondition, WriteOperation};

/// Mutation recorded while the remote store could not be reached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OperationKind {
    Set {
        data: DocumentData,
        #[serde(default)]
        merge: bool,
    },
    /// Creates the document only if absent. Replaying onto an existing document counts as applied,
    /// which is how two devices racing through first-run resolve.
    CreateIfAbsent { data: DocumentData },
    Delete,
    /// Writes that must land together: one commit, all or nothing. The operation's own path is
    /// the first entry.
    Batch { writes: Vec<BatchedWrite> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchedWrite {
    pub path: DocumentPath,
    pub kind: OperationKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub path: DocumentPath,
    pub kind: OperationKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Counter movements carried by the merge patch on `path`, so the patch can be replayed on
    /// top of a newer remote copy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deltas: BTreeMap<String, i64>,
}

impl QueuedOperation {
    /// Logical document key used for per-key ordering.
    pub fn key(&self) -> String {
        self.path.canonical_string()
    }

    pub fn is_create(&self) -> bool {
        matches!(self.kind, OperationKind::CreateIfAbsent { .. })
    }

    pub fn is_batch(&self) -> bool {
        matches!(self.kind, OperationKind::Batch { .. })
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |not_before| not_before <= now)
    }

    /// Whether replaying this operation writes `path`.
    pub fn touches(&self, path: &DocumentPath) -> bool {
        self.paths().any(|candidate| candidate == path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &DocumentPath> + '_ {
        let batched: &[BatchedWrite] = match &self.kind {
            OperationKind::Batch { writes } => writes.as_slice(),
            _ => &[],
        };
        std::iter::once(&self.path).chain(
            batched
                .iter()
                .map(|write| &write.path)
                .filter(move |path| *path != &self.path),
        )
    }

    /// The merge patch this operation applies to its own path, if any.
    pub fn patch_mut(&mut self) -> Option<&mut DocumentData> {
        let path = &self.path;
        match &mut self.kind {
            OperationKind::Set { data, merge: true } => Some(data),
            OperationKind::Batch { writes } => writes.iter_mut().find_map(|write| {
                match (&write.path == path, &mut write.kind) {
                    (true, OperationKind::Set { data, merge: true }) => Some(data),
                    _ => None,
                }
            }),
            _ => None,
        }
    }

    /// Everything this operation commits, in order.
    pub fn to_writes(&self) -> Vec<WriteOperation> {
        match &self.kind {
            OperationKind::Batch { writes } => writes
                .iter()
                .flat_map(|write| write.kind.writes_for(&write.path))
                .collect(),
            kind => kind.writes_for(&self.path),
        }
    }
}

impl OperationKind {
    fn writes_for(&self, path: &DocumentPath) -> Vec<WriteOperation> {
        match self {
            OperationKind::Set { data, merge: true } => {
                vec![WriteOperation::merge(path.clone(), data.clone())]
            }
            OperationKind::Set { data, merge: false } => {
                vec![WriteOperation::set(path.clone(), data.clone())]
            }
            OperationKind::CreateIfAbsent { data } => {
                vec![WriteOperation::create(path.clone(), data.clone())]
            }
            OperationKind::Delete => vec![WriteOperation::delete(path.clone())],
            OperationKind::Batch { writes } => writes
                .iter()
                .flat_map(|write| write.kind.writes_for(&write.path))
                .collect(),
        }
    }

    /// Inverse of [`QueuedOperation::to_writes`] for one write; preconditions other than "must
    /// not exist" are not representable offline and are dropped.
    pub fn from_write(write: &WriteOperation) -> (DocumentPath, OperationKind) {
        match write {
            WriteOperation::Set {
                path,
                data,
                merge,
                precondition,
            } => {
                let kind = if *precondition == Precondition::Exists(false) {
                    OperationKind::CreateIfAbsent { data: data.clone() }
                } else {
                    OperationKind::Set {
                        data: data.clone(),
                        merge: *merge,
                    }
                };
                (path.clone(), kind)
            }
            WriteOperation::Delete { path, .. } => (path.clone(), OperationKind::Delete),
        }
    }

    /// One queue entry for `writes`: the single write itself, or a batch keyed by the first
    /// write's path. `None` for an empty slice.
    pub fn from_writes(writes: &[WriteOperation]) -> Option<(DocumentPath, OperationKind)> {
        match writes {
            [] => None,
            [single] => Some(Self::from_write(single)),
            [first, ..] => {
                let batched = writes
                    .iter()
                    .map(|write| {
                        let (path, kind) = Self::from_write(write);
                        BatchedWrite { path, kind }
                    })
                    .collect();
                Some((
                    first.path().clone(),
                    OperationKind::Batch { writes: batched },
                ))
            }
        }
    }
}

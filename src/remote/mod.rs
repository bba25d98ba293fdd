//! Remote Document Store client abstraction.
//!
//! Documents are addressed by `(collection path, document id)` and hold JSON objects. The
//! [`RemoteDocumentStore`] trait is what the sync core talks to; [`InMemoryRemoteStore`] implements
//! it in process with commit-time ordering, preconditions and change listeners.

mod datastore;
mod in_memory;
mod path;
mod query;
mod snapshot;

pub use datastore::{
    CommitResult, DocumentListener, Precondition, QueryListener, RemoteDocumentStore,
    RemoteStoreArc, WriteOperation,
};
pub use in_memory::{InMemoryRemoteStore, RemoteStats};
pub use path::{CollectionPath, DocumentPath};
pub use query::{DocumentQuery, FieldFilter, FilterOperator, OrderBy, OrderDirection};
pub use snapshot::{encode_document, DocumentData, DocumentSnapshot};

pub(crate) use snapshot::{assign_field, lookup_field, merge_into};

/// Collection and document naming used by the game backend.
pub mod schema {
    use super::{CollectionPath, DocumentPath};
    use crate::error::RunnerResult;

    pub const USERS: &str = "users";
    pub const BOTS: &str = "bots";
    pub const PURCHASES: &str = "purchases";
    pub const LEADERBOARDS: &str = "leaderboards";
    pub const ENTRIES: &str = "entries";
    pub const TOURNAMENTS: &str = "tournaments";
    pub const CURRENCY_TRANSACTIONS: &str = "currency_transactions";
    pub const PENDING_SCORES: &str = "pending_scores";

    pub fn user(player_id: &str) -> RunnerResult<DocumentPath> {
        DocumentPath::from_segments([USERS, player_id])
    }

    pub fn bots(player_id: &str) -> RunnerResult<CollectionPath> {
        CollectionPath::from_segments([USERS, player_id, BOTS])
    }

    pub fn bot(player_id: &str, bot_id: &str) -> RunnerResult<DocumentPath> {
        DocumentPath::from_segments([USERS, player_id, BOTS, bot_id])
    }

    pub fn purchases(player_id: &str) -> RunnerResult<CollectionPath> {
        CollectionPath::from_segments([USERS, player_id, PURCHASES])
    }

    pub fn leaderboard_entries(partition_id: &str) -> RunnerResult<CollectionPath> {
        CollectionPath::from_segments([LEADERBOARDS, partition_id, ENTRIES])
    }

    pub fn tournament(tournament_id: &str) -> RunnerResult<DocumentPath> {
        DocumentPath::from_segments([TOURNAMENTS, tournament_id])
    }

    pub fn tournaments() -> RunnerResult<CollectionPath> {
        CollectionPath::from_segments([TOURNAMENTS])
    }

    pub fn currency_transaction(transaction_id: &str) -> RunnerResult<DocumentPath> {
        DocumentPath::from_segments([CURRENCY_TRANSACTIONS, transaction_id])
    }

    pub fn currency_transactions() -> RunnerResult<CollectionPath> {
        CollectionPath::from_segments([CURRENCY_TRANSACTIONS])
    }

    pub fn pending_score(entry_id: &str) -> RunnerResult<DocumentPath> {
        DocumentPath::from_segments([PENDING_SCORES, entry_id])
    }
}

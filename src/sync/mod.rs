//! Sync Engine: reconciles the device cache, the operation queue and the remote store.
//!
//! Reads go remote-first when reachable and fall back to the cache. Writes land in the cache
//! immediately and are committed or queued. Real-time pushes are folded in unless they carry an
//! older version marker than the local copy.

mod engine;
mod events;
mod merge;
mod quota;
mod settings;
mod state;

pub use engine::{
    Freshness, Loaded, ProfileMutation, SyncEngine, SyncServices, WriteOutcome,
};
pub use events::{ChangeOrigin, DrainReport, SyncEvent};
pub use merge::{
    counter_deltas, decide_push, diff_patch, overlay_remote, rebase_patch, version_of, FieldDeltas,
    PushDecision, VERSION_FIELD,
};
pub use quota::{QuotaMeter, QuotaUsage};
pub use settings::{
    default_starting_balances, SyncSettings, DEFAULT_DAILY_READ_BUDGET,
    DEFAULT_DAILY_WRITE_BUDGET, DEFAULT_DRAIN_BATCH_SIZE, DEFAULT_DRAIN_INTERVAL_MILLIS,
    DEFAULT_PROFILE_MAX_AGE_MILLIS, DEFAULT_REFRESH_INTERVAL_MILLIS,
    DEFAULT_REMOTE_TIMEOUT_MILLIS,
};
pub use state::{CollectionState, ManagedCollection};

use crate::model::PlayerProfile;
use crate::sync::state::{CollectionState, ManagedCollection};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    /// Rejected and rescheduled.
    pub failed: usize,
    /// Removed after exhausting retries.
    pub dropped: usize,
    /// Refused by the remote store for good (a precondition failed) and removed.
    pub rejected: usize,
    pub remaining: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    ProfileChanged {
        profile: PlayerProfile,
        origin: ChangeOrigin,
    },
    BotsChanged {
        owner_id: String,
    },
    QueueDrained(DrainReport),
    /// A queued write was refused by the remote store and removed without effect. The cached
    /// copies of `paths` were rolled back to the remote state.
    WriteRejected {
        paths: Vec<String>,
        reason: String,
    },
    /// Non-fatal: something could not be synchronised and was given up on.
    SyncDegraded {
        reason: String,
    },
    ConnectivityChanged {
        online: bool,
    },
    QueueOverflow {
        evicted: usize,
    },
    RemotePushDiscarded {
        path: String,
        remote_version: u64,
        local_version: u64,
    },
    StateChanged {
        collection: ManagedCollection,
        state: CollectionState,
    },
}

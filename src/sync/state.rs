use std::collections::HashMap;
use std::sync::Mutex;

/// Collections whose lifecycle the sync engine tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagedCollection {
    Profile,
    Bots,
    LeaderboardSnapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CollectionState {
    #[default]
    Uninitialized,
    Loading,
    Ready {
        stale: bool,
    },
    Syncing,
}

impl CollectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, CollectionState::Ready { .. })
    }

    /// Allowed moves: first access loads, a ready collection syncs, and both settle into ready.
    pub fn can_transition_to(&self, next: CollectionState) -> bool {
        use CollectionState::*;
        matches!(
            (self, next),
            (Uninitialized, Loading)
                | (Loading, Ready { .. })
                | (Ready { .. }, Syncing)
                | (Syncing, Ready { .. })
                | (Ready { .. }, Ready { .. })
        )
    }
}

#[derive(Debug, Default)]
pub(crate) struct StateTable {
    states: Mutex<HashMap<ManagedCollection, CollectionState>>,
}

impl StateTable {
    pub(crate) fn get(&self, collection: ManagedCollection) -> CollectionState {
        self.states
            .lock()
            .unwrap()
            .get(&collection)
            .copied()
            .unwrap_or_default()
    }

    /// Moves `collection` into the state that begins a load or a sync, whichever applies.
    pub(crate) fn begin(&self, collection: ManagedCollection) -> Option<CollectionState> {
        let mut states = self.states.lock().unwrap();
        let current = states.get(&collection).copied().unwrap_or_default();
        let next = match current {
            CollectionState::Uninitialized => CollectionState::Loading,
            CollectionState::Ready { .. } => CollectionState::Syncing,
            CollectionState::Loading | CollectionState::Syncing => return None,
        };
        states.insert(collection, next);
        Some(next)
    }

    pub(crate) fn finish(
        &self,
        collection: ManagedCollection,
        stale: bool,
    ) -> Option<CollectionState> {
        let mut states = self.states.lock().unwrap();
        let current = states.get(&collection).copied().unwrap_or_default();
        let next = CollectionState::Ready { stale };
        if current == next {
            return None;
        }
        if current != CollectionState::Uninitialized && !current.can_transition_to(next) {
            return None;
        }
        states.insert(collection, next);
        Some(next)
    }

    pub(crate) fn reset(&self) {
        self.states.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_then_sync_cycle() {
        let table = StateTable::default();
        let collection = ManagedCollection::Profile;
        assert_eq!(table.begin(collection), Some(CollectionState::Loading));
        assert_eq!(table.begin(collection), None);
        assert_eq!(
            table.finish(collection, false),
            Some(CollectionState::Ready { stale: false })
        );
        assert_eq!(table.begin(collection), Some(CollectionState::Syncing));
        assert_eq!(
            table.finish(collection, true),
            Some(CollectionState::Ready { stale: true })
        );
        assert!(table.get(collection).is_ready());
        assert_eq!(table.get(ManagedCollection::Bots), CollectionState::Uninitialized);
    }

    #[test]
    fn transition_rules() {
        assert!(CollectionState::Uninitialized.can_transition_to(CollectionState::Loading));
        assert!(!CollectionState::Uninitialized.can_transition_to(CollectionState::Syncing));
        assert!(!CollectionState::Loading.can_transition_to(CollectionState::Syncing));
    }
}

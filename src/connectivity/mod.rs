//! Connectivity oracle collaborator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::util::{EventBus, Subscription};

pub trait ConnectivityOracle: Send + Sync {
    fn is_online(&self) -> bool;

    /// Invoked with the new state on every reachability change.
    fn subscribe(&self, listener: Box<dyn Fn(&bool) + Send + Sync>) -> Subscription;
}

pub type ConnectivityArc = Arc<dyn ConnectivityOracle>;

/// Reachability flag flipped by the host's network monitor.
#[derive(Clone)]
pub struct ManualConnectivity {
    online: Arc<AtomicBool>,
    events: EventBus<bool>,
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for ManualConnectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualConnectivity")
            .field("online", &self.is_online())
            .finish()
    }
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
            events: EventBus::new(),
        }
    }

    /// Updates the flag; listeners only hear about actual transitions.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            self.events.publish(online);
        }
    }

    /// Async view of transitions, for hosts that drive sync from a task.
    pub fn changes(&self) -> async_channel::Receiver<bool> {
        self.events.channel()
    }
}

impl ConnectivityOracle for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: Box<dyn Fn(&bool) + Send + Sync>) -> Subscription {
        self.events.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn publishes_transitions_only() {
        let connectivity = ManualConnectivity::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription =
            connectivity.subscribe(Box::new(move |online| sink.lock().unwrap().push(*online)));
        let changes = connectivity.changes();

        connectivity.set_online(true);
        connectivity.set_online(false);
        connectivity.set_online(false);
        connectivity.set_online(true);

        assert_eq!(seen.lock().unwrap().as_slice(), &[false, true]);
        assert_eq!(changes.try_recv().unwrap(), false);
        assert!(connectivity.is_online());
    }
}

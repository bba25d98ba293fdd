use std::fmt;
use std::sync::{Arc, Mutex};

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

/// Handle returned by every `subscribe`; dropping it (or calling `unsubscribe`) detaches the
/// listener.
pub struct Subscription {
    cleanup: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Subscription {
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    pub fn noop() -> Self {
        Self { cleanup: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cleanup.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

struct BusState<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
    channels: Vec<async_channel::Sender<E>>,
}

/// In-order publish/subscribe channel.
///
/// Each listener sees events in publish order. Listeners run on the publishing task, outside the
/// bus lock, so a listener may publish or subscribe again without deadlocking.
pub struct EventBus<E> {
    state: Arc<Mutex<BusState<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_id: 1,
                listeners: Vec::new(),
                channels: Vec::new(),
            })),
        }
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("EventBus")
            .field("listeners", &state.listeners.len())
            .field("channels", &state.channels.len())
            .finish()
    }
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.push((id, Arc::new(listener)));
            id
        };

        let state = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                state
                    .lock()
                    .unwrap()
                    .listeners
                    .retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Returns an unbounded receiver fed with every subsequent event. Dropping the receiver
    /// detaches it on the next publish.
    pub fn channel(&self) -> async_channel::Receiver<E> {
        let (sender, receiver) = async_channel::unbounded();
        self.state.lock().unwrap().channels.push(sender);
        receiver
    }

    pub fn publish(&self, event: E) {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            state
                .channels
                .retain(|sender| sender.try_send(event.clone()).is_ok());
            state
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect::<Vec<_>>()
        };

        for listener in listeners {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.listeners.len() + state.channels.len()
    }
}

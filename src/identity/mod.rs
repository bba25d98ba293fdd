//! Identity provider collaborator.
//!
//! The core never talks to an auth backend; it only asks who is signed in and reacts to
//! sign-in / sign-out transitions.

use std::sync::{Arc, Mutex};

use crate::error::{unauthenticated, RunnerResult};
use crate::util::{EventBus, Subscription};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthStateChange {
    SignedIn { user_id: String },
    SignedOut { user_id: String },
}

pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;

    fn is_authenticated(&self) -> bool {
        self.current_user_id().is_some()
    }

    fn subscribe(&self, listener: Box<dyn Fn(&AuthStateChange) + Send + Sync>) -> Subscription;
}

pub type IdentityArc = Arc<dyn IdentityProvider>;

/// Player id of the active session, or `Unauthenticated`.
pub fn require_user(identity: &dyn IdentityProvider) -> RunnerResult<String> {
    match identity.current_user_id() {
        Some(user_id) if identity.is_authenticated() => Ok(user_id),
        _ => Err(unauthenticated("no signed-in player")),
    }
}

/// Identity provider driven explicitly by the host (or by tests).
#[derive(Clone, Default)]
pub struct StaticIdentityProvider {
    current: Arc<Mutex<Option<String>>>,
    events: EventBus<AuthStateChange>,
}

impl std::fmt::Debug for StaticIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticIdentityProvider")
            .field("current", &*self.current.lock().unwrap())
            .finish()
    }
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        let provider = Self::new();
        *provider.current.lock().unwrap() = Some(user_id.into());
        provider
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        let previous = self.current.lock().unwrap().replace(user_id.clone());
        if let Some(previous) = previous {
            if previous == user_id {
                return;
            }
            self.events
                .publish(AuthStateChange::SignedOut { user_id: previous });
        }
        self.events.publish(AuthStateChange::SignedIn { user_id });
    }

    pub fn sign_out(&self) {
        let previous = self.current.lock().unwrap().take();
        if let Some(user_id) = previous {
            self.events.publish(AuthStateChange::SignedOut { user_id });
        }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn current_user_id(&self) -> Option<String> {
        self.current.lock().unwrap().clone()
    }

    fn subscribe(&self, listener: Box<dyn Fn(&AuthStateChange) + Send + Sync>) -> Subscription {
        self.events.subscribe(listener)
    }
}

//! Session state machine and the navigation signals it emits.
//!
//! ```text
//! Restoring ──▶ Unauthenticated ──▶ Authenticating ──▶ Authenticated
//!     │               ▲                   │                  │
//!     └───────────────┼───────────────────┘ (failure)        │
//!                     └──────────── logout / terminate ──────┘
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::store::CredentialStore;
use crate::types::{CredentialPair, Principal};

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Reading durable storage at startup.
    Restoring,
    Unauthenticated,
    /// A login exchange is in flight.
    Authenticating,
    Authenticated,
}

/// Why a session ended. Lets the login view tell "you logged out" from
/// "your session expired".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LoggedOut,
    Expired,
}

/// Signals consumed by navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Login succeeded; navigate to `redirect` (or the home view).
    Established { redirect: Option<String> },
    /// Session is gone; navigate to login.
    Ended { reason: EndReason },
}

/// Orchestrates login/logout/restore transitions over a shared [`CredentialStore`].
pub struct SessionLifecycle {
    store: Arc<CredentialStore>,
    state: watch::Sender<LifecycleState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionLifecycle {
    #[must_use]
    pub fn new(store: Arc<CredentialStore>) -> Self {
        let initial = if store.is_authenticated() {
            LifecycleState::Authenticated
        } else {
            LifecycleState::Unauthenticated
        };
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            state,
            events,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    /// Adopt a previously persisted session without contacting the network.
    ///
    /// A stale token is discovered by the first request that fails with expiry,
    /// which then drives the normal refresh/terminate path. Partial leftovers
    /// (a token without a principal) are cleared.
    pub fn restore_from_persistence(&self) -> bool {
        self.state.send_replace(LifecycleState::Restoring);

        match self.store.load_persisted() {
            Some(session) => {
                self.store.adopt(session);
                self.state.send_replace(LifecycleState::Authenticated);
                tracing::info!("Restored persisted session");
                true
            }
            None => {
                self.store.clear();
                self.state.send_replace(LifecycleState::Unauthenticated);
                tracing::debug!("No persisted session to restore");
                false
            }
        }
    }

    /// User-initiated logout.
    pub fn logout(&self) {
        self.store.clear();
        self.state.send_replace(LifecycleState::Unauthenticated);
        tracing::info!("Logged out");
        self.emit(SessionEvent::Ended {
            reason: EndReason::LoggedOut,
        });
    }

    /// Forced logout after an irrecoverable refresh failure.
    ///
    /// Always clears the store. Emits `Ended { Expired }` only on the transition
    /// out of a live state, so a burst of failing requests yields one signal.
    pub fn terminate(&self) {
        self.store.clear();
        self.end_expired();
    }

    /// [`terminate`](Self::terminate), but only if the session of `generation`
    /// is still the live one. A newer session (re-login) is left alone.
    pub(crate) fn terminate_generation(&self, generation: u64) -> bool {
        if !self.store.clear_if_current(generation) {
            tracing::debug!(generation, "Session already replaced; not terminating");
            return false;
        }
        self.end_expired();
        true
    }

    fn end_expired(&self) {
        let previous = self.state.send_replace(LifecycleState::Unauthenticated);
        if previous == LifecycleState::Unauthenticated {
            tracing::debug!("Terminate on an already-ended session");
            return;
        }
        tracing::warn!(?previous, "Session terminated: credential could not be renewed");
        self.emit(SessionEvent::Ended {
            reason: EndReason::Expired,
        });
    }

    pub(crate) fn begin_authenticating(&self) {
        self.state.send_replace(LifecycleState::Authenticating);
    }

    pub(crate) fn establish(
        &self,
        credentials: CredentialPair,
        principal: Principal,
        redirect: Option<String>,
    ) {
        self.store.set(credentials, principal);
        self.state.send_replace(LifecycleState::Authenticated);
        self.emit(SessionEvent::Established { redirect });
    }

    /// Login failed: fall back to whatever the store still says.
    pub(crate) fn abort_authenticating(&self) {
        let state = if self.store.is_authenticated() {
            LifecycleState::Authenticated
        } else {
            LifecycleState::Unauthenticated
        };
        self.state.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine: nothing is navigating yet.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        ACCESS_TOKEN_KEY, MemoryStorage, REFRESH_TOKEN_KEY, SessionStorage, USER_KEY,
    };

    fn lifecycle_with_storage() -> (SessionLifecycle, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(CredentialStore::new(Arc::clone(&storage)));
        (SessionLifecycle::new(store), storage)
    }

    fn pair() -> CredentialPair {
        CredentialPair::new("A".into(), Some("R".into()))
    }

    #[test]
    fn restore_adopts_persisted_session() {
        let (lifecycle, storage) = lifecycle_with_storage();
        storage
            .apply(&[
                (ACCESS_TOKEN_KEY, Some("A".into())),
                (USER_KEY, Some(r#"{"id": 9, "role": "admin"}"#.into())),
            ])
            .unwrap();

        assert!(lifecycle.restore_from_persistence());
        assert_eq!(lifecycle.state(), LifecycleState::Authenticated);
        assert!(lifecycle.is_authenticated());
        assert!(lifecycle.store().get().principal().unwrap().is_admin());
    }

    #[test]
    fn restore_clears_partial_leftovers() {
        let (lifecycle, storage) = lifecycle_with_storage();
        storage
            .apply(&[
                (ACCESS_TOKEN_KEY, Some("A".into())),
                (REFRESH_TOKEN_KEY, Some("R".into())),
            ])
            .unwrap();

        assert!(!lifecycle.restore_from_persistence());
        assert_eq!(lifecycle.state(), LifecycleState::Unauthenticated);
        assert!(storage.is_empty());
    }

    #[test]
    fn establish_then_logout_emits_both_signals() {
        let (lifecycle, storage) = lifecycle_with_storage();
        let mut events = lifecycle.subscribe();

        lifecycle.begin_authenticating();
        assert_eq!(lifecycle.state(), LifecycleState::Authenticating);
        lifecycle.establish(pair(), Principal::new(1), Some("/matches".into()));
        assert_eq!(lifecycle.state(), LifecycleState::Authenticated);

        lifecycle.logout();
        assert_eq!(lifecycle.state(), LifecycleState::Unauthenticated);
        assert!(storage.is_empty());

        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Established {
                redirect: Some("/matches".into())
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ended {
                reason: EndReason::LoggedOut
            }
        );
    }

    #[test]
    fn terminate_signals_once() {
        let (lifecycle, storage) = lifecycle_with_storage();
        lifecycle.establish(pair(), Principal::new(1), None);
        let mut events = lifecycle.subscribe();

        lifecycle.terminate();
        lifecycle.terminate();

        assert!(storage.is_empty());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ended {
                reason: EndReason::Expired
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn terminate_generation_spares_a_new_login() {
        let (lifecycle, _) = lifecycle_with_storage();
        lifecycle.establish(pair(), Principal::new(1), None);
        let stale = lifecycle.store().generation();
        lifecycle.logout();
        lifecycle.establish(pair(), Principal::new(2), None);
        let mut events = lifecycle.subscribe();

        assert!(!lifecycle.terminate_generation(stale));
        assert!(lifecycle.is_authenticated());
        assert_eq!(lifecycle.state(), LifecycleState::Authenticated);
        assert!(events.try_recv().is_err());

        assert!(lifecycle.terminate_generation(lifecycle.store().generation()));
        assert!(!lifecycle.is_authenticated());
    }

    #[test]
    fn abort_restores_previous_state() {
        let (lifecycle, _) = lifecycle_with_storage();
        lifecycle.begin_authenticating();
        lifecycle.abort_authenticating();
        assert_eq!(lifecycle.state(), LifecycleState::Unauthenticated);

        lifecycle.establish(pair(), Principal::new(1), None);
        lifecycle.begin_authenticating();
        lifecycle.abort_authenticating();
        assert_eq!(lifecycle.state(), LifecycleState::Authenticated);
    }

    #[tokio::test]
    async fn state_watchers_observe_transitions() {
        let (lifecycle, _) = lifecycle_with_storage();
        let mut watcher = lifecycle.watch_state();

        lifecycle.establish(pair(), Principal::new(1), None);
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow_and_update(), LifecycleState::Authenticated);
    }
}

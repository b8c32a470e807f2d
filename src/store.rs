use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::storage::{
    ACCESS_TOKEN_KEY, MemoryStorage, REFRESH_TOKEN_KEY, SessionStorage, StorageWrite, USER_KEY,
};
use crate::types::{AccessToken, CredentialPair, Principal, RefreshToken, Session};

/// Holds the current session and mirrors it into durable storage.
///
/// The in-memory [`Session`] is the source of truth. Mutations replace it under
/// the write lock, so readers never observe a token without its principal.
/// Storage is written after the lock is released, in the same order the
/// mutations happened. Storage failures are logged and do not fail the
/// operation; the next successful write brings storage back in line.
///
/// Every `set`, `clear` and restore starts a new session generation. Work that
/// began under one generation (a refresh episode) must not touch another.
pub struct CredentialStore {
    session: RwLock<Session>,
    generation: AtomicU64,
    storage: Box<dyn SessionStorage>,
    // Held from the memory update until storage is written.
    write_order: Mutex<()>,
}

impl CredentialStore {
    /// Create an empty store backed by `storage`.
    ///
    /// Persisted data is not read until [`SessionLifecycle::restore_from_persistence`](crate::SessionLifecycle::restore_from_persistence).
    #[must_use]
    pub fn new(storage: impl SessionStorage) -> Self {
        Self {
            session: RwLock::new(Session::empty()),
            generation: AtomicU64::new(0),
            storage: Box::new(storage),
            write_order: Mutex::new(()),
        }
    }

    /// Store without durable backing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryStorage::new())
    }

    /// Snapshot of the current session.
    #[must_use]
    pub fn get(&self) -> Session {
        self.session.read().clone()
    }

    /// Snapshot of the current session and the generation it belongs to.
    pub(crate) fn snapshot(&self) -> (Session, u64) {
        let session = self.session.read();
        (session.clone(), self.generation.load(Ordering::Acquire))
    }

    /// Generation of the live session. Only changes under the write lock.
    #[must_use]
    pub fn generation(&self) -> u64 {
        let _session = self.session.read();
        self.generation.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn access_token(&self) -> Option<AccessToken> {
        self.session.read().access_token().cloned()
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.session.read().refresh_token().cloned()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.read().is_authenticated()
    }

    /// Replace all three fields at once. An absent refresh token removes the stored one.
    pub fn set(&self, credentials: CredentialPair, principal: Principal) {
        let user = match serde_json::to_string(&principal) {
            Ok(user) => user,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize principal; session not persisted");
                let mut session = self.session.write();
                *session = Session::established(credentials, principal);
                self.bump_generation();
                return;
            }
        };

        let mut session = self.session.write();
        let batch = [
            (ACCESS_TOKEN_KEY, Some(credentials.access_token.as_str().to_owned())),
            (
                REFRESH_TOKEN_KEY,
                credentials.refresh_token.as_ref().map(|t| t.as_str().to_owned()),
            ),
            (USER_KEY, Some(user)),
        ];
        *session = Session::established(credentials, principal);
        self.bump_generation();
        self.mirror(session, &batch);
    }

    /// Remove all three fields from memory and storage.
    pub fn clear(&self) {
        let session = self.session.write();
        self.clear_locked(session);
    }

    /// Clear only if `generation` is still the live session.
    ///
    /// Returns `false` (and changes nothing) when another session has replaced it.
    pub(crate) fn clear_if_current(&self, generation: u64) -> bool {
        let session = self.session.write();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.clear_locked(session);
        true
    }

    fn clear_locked(&self, mut session: RwLockWriteGuard<'_, Session>) {
        *session = Session::empty();
        self.bump_generation();
        self.mirror(
            session,
            &[
                (ACCESS_TOKEN_KEY, None),
                (REFRESH_TOKEN_KEY, None),
                (USER_KEY, None),
            ],
        );
    }

    /// Install renewed tokens, keeping the current refresh token when the
    /// exchange did not rotate it.
    ///
    /// Returns `false` (and changes nothing) unless `generation` is still the
    /// live session, so a late refresh can neither resurrect a logged-out
    /// session nor overwrite one established after it started.
    pub(crate) fn renew(
        &self,
        generation: u64,
        access_token: AccessToken,
        refresh_token: Option<RefreshToken>,
    ) -> bool {
        let mut session = self.session.write();
        if self.generation.load(Ordering::Acquire) != generation || session.principal.is_none() {
            return false;
        }
        let Some(current) = session.credentials.as_mut() else {
            return false;
        };

        let mut batch: Vec<StorageWrite> =
            vec![(ACCESS_TOKEN_KEY, Some(access_token.as_str().to_owned()))];
        if let Some(rotated) = &refresh_token {
            batch.push((REFRESH_TOKEN_KEY, Some(rotated.as_str().to_owned())));
        }

        current.access_token = access_token;
        if refresh_token.is_some() {
            current.refresh_token = refresh_token;
        }
        self.mirror(session, &batch);
        true
    }

    /// Replace the principal of an established session (e.g. after `me`).
    pub(crate) fn replace_principal(&self, principal: Principal) -> bool {
        let mut session = self.session.write();
        if session.credentials.is_none() {
            return false;
        }
        let user = serde_json::to_string(&principal);
        session.principal = Some(principal);
        match user {
            Ok(user) => self.mirror(session, &[(USER_KEY, Some(user))]),
            Err(e) => tracing::error!(error = %e, "Failed to serialize principal"),
        }
        true
    }

    /// Read the persisted session without touching memory.
    ///
    /// Yields `None` unless both an access token and a readable principal are stored.
    pub(crate) fn load_persisted(&self) -> Option<Session> {
        let access_token = self.storage.get(ACCESS_TOKEN_KEY)?;
        let user = self.storage.get(USER_KEY)?;
        let principal: Principal = match serde_json::from_str(&user) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Persisted principal is unreadable");
                return None;
            }
        };
        let refresh_token = self.storage.get(REFRESH_TOKEN_KEY).map(RefreshToken::new);

        Some(Session::established(
            CredentialPair::new(AccessToken::new(access_token), refresh_token),
            principal,
        ))
    }

    /// Adopt an already-persisted session into memory.
    pub(crate) fn adopt(&self, restored: Session) {
        let mut session = self.session.write();
        *session = restored;
        self.bump_generation();
    }

    // Callers hold the write lock.
    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Release the session lock, then write `batch` to storage.
    ///
    /// `write_order` is taken before the session lock is dropped, so storage
    /// sees batches in the order memory changed while readers are not held up
    /// by disk I/O.
    fn mirror(&self, session: RwLockWriteGuard<'_, Session>, batch: &[StorageWrite]) {
        let _order = self.write_order.lock();
        drop(session);
        if let Err(e) = self.storage.apply(batch) {
            tracing::warn!(error = %e, "Session storage write failed");
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

//! Single-flight renewal of the access credential.
//!
//! At most one refresh exchange is in flight at any instant. Every request that
//! observes expiry while an episode is running awaits that same episode and
//! receives its outcome; the store is updated before any of them resumes. The
//! episode slot is emptied as soon as the exchange resolves, so the next expiry
//! starts a fresh one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::config::ClientConfig;
use crate::error::{Error, ensure_success};
use crate::lifecycle::SessionLifecycle;
use crate::types::{AccessToken, RefreshToken};

/// Refresh exchange response body.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct RefreshResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
}

// Shared outputs must be Clone; reqwest errors are not, so waiters get the message.
type EpisodeOutcome = Result<AccessToken, String>;
type Episode = Shared<BoxFuture<'static, EpisodeOutcome>>;

struct ActiveEpisode {
    id: u64,
    future: Episode,
}

/// Coordinates credential renewal across concurrently failing requests.
pub struct RefreshCoordinator {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    lifecycle: Arc<SessionLifecycle>,
    active: Arc<Mutex<Option<ActiveEpisode>>>,
    next_id: AtomicU64,
    exchanges: Arc<AtomicU64>,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        config: Arc<ClientConfig>,
        lifecycle: Arc<SessionLifecycle>,
    ) -> Self {
        Self {
            http,
            config,
            lifecycle,
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            exchanges: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Obtain a renewed access token.
    ///
    /// `rejected` is the token the failing request was sent with. If the store
    /// already holds a different one (an episode finished in between), that
    /// token is returned without a new exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RefreshUnavailable`] if no refresh token is held or the
    /// exchange fails. In both cases the session the request belonged to has
    /// been terminated, unless a newer login replaced it in the meantime.
    pub async fn refresh(&self, rejected: Option<&AccessToken>) -> Result<AccessToken, Error> {
        let episode = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(running) => {
                    tracing::debug!(episode = running.id, "Joining refresh in flight");
                    running.future.clone()
                }
                None => {
                    let (session, generation) = self.lifecycle.store().snapshot();
                    if let Some(current) = session.access_token() {
                        if Some(current) != rejected {
                            tracing::debug!("Credential already renewed; skipping refresh");
                            return Ok(current.clone());
                        }
                    }

                    let Some(refresh_token) = session.refresh_token().cloned() else {
                        drop(active);
                        tracing::warn!("No refresh token available");
                        self.lifecycle.terminate_generation(generation);
                        return Err(Error::RefreshUnavailable("no refresh token".into()));
                    };

                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = self.start_episode(id, generation, refresh_token);
                    *active = Some(ActiveEpisode {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };

        episode.await.map_err(Error::RefreshUnavailable)
    }

    /// Number of refresh exchanges sent so far.
    #[must_use]
    pub fn exchanges_started(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Run one exchange on behalf of the session of `generation`.
    ///
    /// If that session has been replaced by the time the exchange resolves,
    /// neither outcome touches the store: the token is discarded and a failure
    /// does not terminate the newer session.
    fn start_episode(&self, id: u64, generation: u64, refresh_token: RefreshToken) -> Episode {
        let http = self.http.clone();
        let config = Arc::clone(&self.config);
        let lifecycle = Arc::clone(&self.lifecycle);
        let active = Arc::clone(&self.active);
        let exchanges = Arc::clone(&self.exchanges);

        async move {
            tracing::info!(episode = id, "Refreshing access token");
            exchanges.fetch_add(1, Ordering::Relaxed);

            let outcome = match exchange(&http, &config, &refresh_token).await {
                Ok(renewed) => {
                    let access_token = renewed.access_token.clone();
                    if lifecycle
                        .store()
                        .renew(generation, renewed.access_token, renewed.refresh_token)
                    {
                        tracing::info!(episode = id, "Access token refreshed");
                        Ok(access_token)
                    } else {
                        tracing::info!(episode = id, "Session ended while refreshing; discarding token");
                        Err("session ended during refresh".to_owned())
                    }
                }
                Err(e) => {
                    tracing::warn!(episode = id, error = %e, "Refresh exchange failed");
                    lifecycle.terminate_generation(generation);
                    Err(e.to_string())
                }
            };

            let mut slot = active.lock();
            if slot.as_ref().is_some_and(|running| running.id == id) {
                *slot = None;
            }
            outcome
        }
        .boxed()
        .shared()
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refreshing", &self.is_refreshing())
            .field("exchanges_started", &self.exchanges_started())
            .finish_non_exhaustive()
    }
}

/// `POST <refresh path>` authenticated by the refresh token.
async fn exchange(
    http: &reqwest::Client,
    config: &ClientConfig,
    refresh_token: &RefreshToken,
) -> Result<RefreshResponse, Error> {
    let response = http
        .post(config.endpoint(config.refresh_path())?)
        .timeout(config.timeout())
        .bearer_auth(refresh_token.as_str())
        .json(&serde_json::json!({}))
        .send()
        .await?;

    let response = ensure_success(response, "refresh exchange").await?;
    response.json::<RefreshResponse>().await.map_err(Into::into)
}

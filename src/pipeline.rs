//! Outbound request pipeline.
//!
//! Each call runs a small state machine:
//!
//! ```text
//! Send ──▶ Done
//!   │
//!   └─(401)─▶ Expired ──▶ refresh ──▶ Send (retried) ──▶ Done
//!                 │
//!                 └─(already retried | refresh failed)─▶ Done(original failure)
//! ```

use std::sync::Arc;
use std::time::Instant;

use reqwest::StatusCode;

use crate::config::ClientConfig;
use crate::error::{Error, ensure_success, read_failure};
use crate::lifecycle::SessionLifecycle;
use crate::refresh::RefreshCoordinator;
use crate::request::{ApiRequest, PendingRequest, attach_credential};
use crate::retry::{RetryDecision, RetryPolicy};

enum Step {
    Send,
    Expired(Error),
    Done(Result<reqwest::Response, Error>),
}

/// Classification of one network round trip.
enum Sent {
    Success(reqwest::Response),
    Expired(Error),
}

/// Attaches credentials, detects expiry and drives refresh + single retry.
pub struct RequestPipeline {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    lifecycle: Arc<SessionLifecycle>,
    coordinator: RefreshCoordinator,
    retry: RetryPolicy,
}

impl RequestPipeline {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        config: Arc<ClientConfig>,
        lifecycle: Arc<SessionLifecycle>,
    ) -> Self {
        let coordinator =
            RefreshCoordinator::new(http.clone(), Arc::clone(&config), Arc::clone(&lifecycle));
        Self {
            http,
            config,
            lifecycle,
            coordinator,
            retry: RetryPolicy,
        }
    }

    #[must_use]
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Send `request` with the current access token.
    ///
    /// A 401 triggers one refresh (shared with any concurrent failures) and one
    /// replay. Only 2xx responses are returned as `Ok`.
    ///
    /// # Errors
    ///
    /// - [`Error::Expired`] if the credential was rejected and could not be
    ///   renewed, or the replay was rejected too.
    /// - [`Error::RequestFailed`] for any other non-success status.
    /// - [`Error::Http`] on network failure.
    pub async fn dispatch(&self, request: ApiRequest) -> Result<reqwest::Response, Error> {
        let request = attach_credential(request, &self.lifecycle.store().get());
        let mut pending = PendingRequest::new(request);
        let mut step = Step::Send;

        loop {
            step = match step {
                Step::Send => match self.send_once(&pending.request).await {
                    Ok(Sent::Success(response)) => Step::Done(Ok(response)),
                    Ok(Sent::Expired(failure)) => Step::Expired(failure),
                    Err(e) => Step::Done(Err(e)),
                },
                Step::Expired(failure) => {
                    if !self.retry.may_retry(&pending) {
                        tracing::warn!(request = %pending.request.describe(), "Credential rejected after refresh");
                        Step::Done(Err(failure))
                    } else {
                        let outcome = self.coordinator.refresh(pending.request.bearer()).await;
                        match self.retry.apply(&mut pending, outcome) {
                            RetryDecision::Redispatch => Step::Send,
                            RetryDecision::Surface => Step::Done(Err(failure)),
                        }
                    }
                }
                Step::Done(result) => return result,
            };
        }
    }

    /// Send exactly once without the session credential and without expiry handling.
    ///
    /// Used for the login and registration exchanges, whose 401 means "bad
    /// credentials", not "expired token".
    pub(crate) async fn send_unauthenticated(
        &self,
        request: &ApiRequest,
    ) -> Result<reqwest::Response, Error> {
        self.send_raw(request).await
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<Sent, Error> {
        let response = self.send_raw(request).await?;

        if response.status() == StatusCode::UNAUTHORIZED
            && !self.config.is_credential_exchange(request.path())
        {
            let (_, body) = read_failure(response).await;
            return Ok(Sent::Expired(Error::Expired {
                detail: body.describe("credential rejected"),
            }));
        }

        ensure_success(response, request.describe())
            .await
            .map(Sent::Success)
    }

    async fn send_raw(&self, request: &ApiRequest) -> Result<reqwest::Response, Error> {
        let started = Instant::now();
        tracing::debug!(
            method = %request.method(),
            path = %request.path(),
            authenticated = request.bearer().is_some(),
            "API request"
        );

        let response = request
            .build(&self.http, &self.config)?
            .send()
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    method = %request.method(),
                    path = %request.path(),
                    error = %e,
                    "API request failed"
                );
            })?;

        tracing::debug!(
            method = %request.method(),
            path = %request.path(),
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "API response"
        );
        Ok(response)
    }
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("base_url", &self.config.base_url().as_str())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

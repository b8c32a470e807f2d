use crate::error::Error;
use crate::request::PendingRequest;
use crate::types::AccessToken;

/// What the pipeline does after a refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the request again with the renewed credential.
    Redispatch,
    /// Give the original expiry failure back to the caller.
    Surface,
}

/// Replays an expired request at most once.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// Whether an expiry on this record may still be recovered.
    #[must_use]
    pub fn may_retry(&self, pending: &PendingRequest) -> bool {
        !pending.retried
    }

    /// Apply a refresh outcome to `pending`.
    ///
    /// On success the record is marked retried and re-armed with the new token.
    /// A record that was already retried is never armed again.
    pub fn apply(
        &self,
        pending: &mut PendingRequest,
        outcome: Result<AccessToken, Error>,
    ) -> RetryDecision {
        match outcome {
            Ok(token) if !pending.retried => {
                pending.retried = true;
                pending.request.set_bearer(token);
                tracing::debug!(request = %pending.request.describe(), "Retrying with renewed credential");
                RetryDecision::Redispatch
            }
            Ok(_) => RetryDecision::Surface,
            Err(e) => {
                tracing::debug!(request = %pending.request.describe(), error = %e, "Not retrying");
                RetryDecision::Surface
            }
        }
    }
}

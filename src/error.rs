use std::collections::BTreeMap;

use serde::Deserialize;

/// Per-field validation messages as returned by the API (`details`).
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Login rejected by the server. Carries the server-provided message.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Registration (or another form submission) rejected with field errors.
    #[error("Validation error: {message}")]
    Validation { message: String, fields: FieldErrors },

    /// No refresh token is held, or the refresh exchange failed.
    #[error("Refresh unavailable: {0}")]
    RefreshUnavailable(String),

    /// The access credential was rejected and could not be renewed.
    #[error("Session expired: {detail}")]
    Expired { detail: String },

    #[error("{operation} failed with status {status}: {detail}")]
    RequestFailed {
        operation: String,
        status: u16,
        detail: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// HTTP status carried by the failure, if the server answered at all.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Expired { .. } => Some(401),
            Self::RequestFailed { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the caller should send the user back to the login view.
    #[must_use]
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Expired { .. } | Self::RefreshUnavailable(_))
    }
}

/// Error payload the API sends with non-success responses:
/// `{"error": code, "message": text, "details": {field: [messages]}}`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default, alias = "msg")]
    pub(crate) message: Option<String>,
    #[serde(default)]
    details: Option<BTreeMap<String, serde_json::Value>>,
}

impl ErrorBody {
    /// Parse a response body; anything that is not the expected JSON shape
    /// becomes the message verbatim.
    pub(crate) fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self {
            message: (!raw.trim().is_empty()).then(|| raw.trim().to_owned()),
            ..Self::default()
        })
    }

    /// Best human-readable description: message, then error code, then `fallback`.
    pub(crate) fn describe(&self, fallback: &str) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| fallback.to_owned())
    }

    /// Flatten `details` into per-field message lists.
    pub(crate) fn field_errors(&self) -> FieldErrors {
        let Some(details) = &self.details else {
            return FieldErrors::new();
        };
        details
            .iter()
            .map(|(field, value)| {
                let messages = match value {
                    serde_json::Value::String(s) => vec![s.clone()],
                    serde_json::Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect(),
                    other => vec![other.to_string()],
                };
                (field.clone(), messages)
            })
            .collect()
    }
}

/// Read status and error payload from a non-success response.
pub(crate) async fn read_failure(response: reqwest::Response) -> (u16, ErrorBody) {
    let status = response.status().as_u16();
    let raw = response.text().await.unwrap_or_default();
    (status, ErrorBody::parse(&raw))
}

/// Checks HTTP response status; returns the response on success or a
/// [`Error::RequestFailed`] with the server's description.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    operation: impl Into<String>,
) -> Result<reqwest::Response, Error> {
    if response.status().is_success() {
        return Ok(response);
    }
    let (status, body) = read_failure(response).await;
    Err(Error::RequestFailed {
        operation: operation.into(),
        status,
        detail: body.describe("no details"),
    })
}

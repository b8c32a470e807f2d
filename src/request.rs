use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use serde::Serialize;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::types::{AccessToken, Session};

/// Owned description of an outbound API call.
///
/// Rebuilt into a fresh `reqwest` request on every dispatch, so a replay after
/// refresh never depends on cloning a consumed body.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    headers: Vec<(HeaderName, HeaderValue)>,
    bearer: Option<AccessToken>,
}

impl ApiRequest {
    /// `path` is relative to the configured base URL.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = path.strip_prefix('/').map(str::to_owned).unwrap_or(path);
        Self {
            method,
            path,
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            bearer: None,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Attach a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if `body` cannot be serialized.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, Error> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Add an extra header.
    ///
    /// `Authorization` is ignored: the pipeline's credential is the only one sent.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if name == AUTHORIZATION {
            tracing::debug!(request = %self.describe(), "Ignoring caller-supplied Authorization header");
            return self;
        }
        self.headers.push((name, value));
        self
    }

    /// Send with an explicit bearer instead of the session's access token.
    #[must_use]
    pub(crate) fn with_bearer(mut self, token: Option<AccessToken>) -> Self {
        self.bearer = token;
        self
    }

    pub(crate) fn set_bearer(&mut self, token: AccessToken) {
        self.bearer = Some(token);
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn bearer(&self) -> Option<&AccessToken> {
        self.bearer.as_ref()
    }

    /// `"GET members"`, used in logs and error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    pub(crate) fn build(
        &self,
        http: &reqwest::Client,
        config: &ClientConfig,
    ) -> Result<reqwest::RequestBuilder, Error> {
        let url = config.endpoint(&self.path)?;

        let mut builder = http
            .request(self.method.clone(), url)
            .timeout(config.timeout());
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token.as_str());
        }
        if let Some(body) = &self.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }
}

/// Bearer-attach step of the pipeline: the session's access token, or none.
#[must_use]
pub fn attach_credential(request: ApiRequest, session: &Session) -> ApiRequest {
    let token = session.access_token().cloned();
    request.with_bearer(token)
}

/// Per-call state carried through the pipeline.
///
/// `retried` flips to true at most once; a second expiry on the same record is fatal.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub(crate) request: ApiRequest,
    pub(crate) retried: bool,
}

impl PendingRequest {
    #[must_use]
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            retried: false,
        }
    }

    #[must_use]
    pub fn request(&self) -> &ApiRequest {
        &self.request
    }

    #[must_use]
    pub fn retried(&self) -> bool {
        self.retried
    }
}

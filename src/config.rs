use std::time::Duration;

use url::Url;

use crate::error::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Clubhouse API client configuration.
///
/// The base URL is a constructor parameter; everything else has a default and
/// can be overridden by chaining.
///
/// ```rust,ignore
/// use clubhouse_auth::ClientConfig;
///
/// let config = ClientConfig::new("https://club.example.com/api".parse()?)
///     .with_timeout(std::time::Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) base_url: Url,
    pub(crate) login_path: String,
    pub(crate) register_path: String,
    pub(crate) refresh_path: String,
    pub(crate) me_path: String,
    pub(crate) timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration rooted at `base_url`.
    ///
    /// A trailing `/` is appended when missing so endpoint paths resolve beneath it.
    #[must_use]
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            login_path: "auth/login".into(),
            register_path: "auth/register".into(),
            refresh_path: "auth/refresh".into(),
            me_path: "auth/me".into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `CLUBHOUSE_API_BASE_URL`: API root, e.g. `https://club.example.com/api`
    ///
    /// # Optional env vars
    /// - `CLUBHOUSE_API_TIMEOUT_MS`: per-request timeout in milliseconds
    /// - `CLUBHOUSE_LOGIN_PATH`, `CLUBHOUSE_REGISTER_PATH`, `CLUBHOUSE_REFRESH_PATH`,
    ///   `CLUBHOUSE_ME_PATH`: endpoint overrides relative to the base URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is missing or a value does not parse.
    pub fn from_env() -> Result<Self, Error> {
        let base = std::env::var("CLUBHOUSE_API_BASE_URL")
            .map_err(|_| Error::Config("CLUBHOUSE_API_BASE_URL is required".into()))?;
        let base_url: Url = base
            .parse()
            .map_err(|e| Error::Config(format!("CLUBHOUSE_API_BASE_URL: {e}")))?;

        let mut config = Self::new(base_url);

        if let Ok(ms) = std::env::var("CLUBHOUSE_API_TIMEOUT_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|e| Error::Config(format!("CLUBHOUSE_API_TIMEOUT_MS: {e}")))?;
            config = config.with_timeout(Duration::from_millis(ms));
        }
        if let Ok(path) = std::env::var("CLUBHOUSE_LOGIN_PATH") {
            config = config.with_login_path(path);
        }
        if let Ok(path) = std::env::var("CLUBHOUSE_REGISTER_PATH") {
            config = config.with_register_path(path);
        }
        if let Ok(path) = std::env::var("CLUBHOUSE_REFRESH_PATH") {
            config = config.with_refresh_path(path);
        }
        if let Ok(path) = std::env::var("CLUBHOUSE_ME_PATH") {
            config = config.with_me_path(path);
        }

        Ok(config)
    }

    /// Override the login endpoint (default: `auth/login`).
    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = normalize_path(path.into());
        self
    }

    /// Override the registration endpoint (default: `auth/register`).
    #[must_use]
    pub fn with_register_path(mut self, path: impl Into<String>) -> Self {
        self.register_path = normalize_path(path.into());
        self
    }

    /// Override the refresh endpoint (default: `auth/refresh`).
    #[must_use]
    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = normalize_path(path.into());
        self
    }

    /// Override the current-principal endpoint (default: `auth/me`).
    #[must_use]
    pub fn with_me_path(mut self, path: impl Into<String>) -> Self {
        self.me_path = normalize_path(path.into());
        self
    }

    /// Override the per-request timeout (default: 10 s).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// API root every endpoint path is resolved against.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Login endpoint path.
    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    /// Registration endpoint path.
    #[must_use]
    pub fn register_path(&self) -> &str {
        &self.register_path
    }

    /// Refresh exchange endpoint path.
    #[must_use]
    pub fn refresh_path(&self) -> &str {
        &self.refresh_path
    }

    /// Current-principal endpoint path.
    #[must_use]
    pub fn me_path(&self) -> &str {
        &self.me_path
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve an endpoint path against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the joined URL is invalid.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(&normalize_path(path.to_owned()))
            .map_err(|e| Error::Config(format!("endpoint {path}: {e}")))
    }

    /// True if `path` names one of the exchanges that authenticate without an
    /// access token. A 401 from these never enters the refresh path.
    pub(crate) fn is_credential_exchange(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');
        path == self.refresh_path || path == self.login_path || path == self.register_path
    }
}

// Paths are relative to the base URL; a leading `/` would replace its path.
fn normalize_path(path: String) -> String {
    match path.strip_prefix('/') {
        Some(rest) => rest.to_owned(),
        None => path,
    }
}

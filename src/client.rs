use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::config::ClientConfig;
use crate::error::{Error, read_failure};
use crate::lifecycle::{LifecycleState, SessionEvent, SessionLifecycle};
use crate::pipeline::RequestPipeline;
use crate::request::ApiRequest;
use crate::storage::SessionStorage;
use crate::store::CredentialStore;
use crate::types::{AccessToken, CredentialPair, Principal, RefreshToken, Session};

const DEFAULT_LOGIN_ERROR: &str = "Login failed; check your account and password";
const DEFAULT_REGISTER_ERROR: &str = "Registration failed";

/// Login form: account identifier (phone number, username or email) and password.
#[derive(Clone, Serialize)]
pub struct LoginCredentials {
    #[serde(rename = "username")]
    identifier: String,
    #[serde(rename = "password")]
    secret: String,
}

impl LoginCredentials {
    #[must_use]
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl std::fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("identifier", &self.identifier)
            .field("secret", &"***")
            .finish()
    }
}

/// Login exchange response body.
#[derive(Debug, Clone, Deserialize)]
struct LoginResponse {
    access_token: AccessToken,
    #[serde(default)]
    refresh_token: Option<RefreshToken>,
    user: Principal,
}

/// Result of a successful registration. No session is established.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct Registration {
    #[serde(default)]
    pub user: Option<Principal>,
    /// Server notice about the generated initial password, if any.
    #[serde(default)]
    pub initial_password_warning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentPrincipal {
    user: Principal,
}

/// Clubhouse API client with automatic credential renewal.
///
/// ```rust,ignore
/// let client = AuthClient::new(ClientConfig::from_env()?, MemoryStorage::new());
/// client.restore_from_persistence();
///
/// let principal = client
///     .login(&LoginCredentials::new("0912345678", "secret"), None)
///     .await?;
/// let members: Vec<Member> = client.get_json("members").await?;
/// ```
pub struct AuthClient {
    config: Arc<ClientConfig>,
    lifecycle: Arc<SessionLifecycle>,
    pipeline: RequestPipeline,
}

impl AuthClient {
    /// Create a client persisting its session into `storage`.
    ///
    /// The persisted session is not adopted until
    /// [`restore_from_persistence`](Self::restore_from_persistence) is called.
    #[must_use]
    pub fn new(config: ClientConfig, storage: impl SessionStorage) -> Self {
        let store = Arc::new(CredentialStore::new(storage));
        Self::assemble(
            Arc::new(config),
            reqwest::Client::new(),
            Arc::new(SessionLifecycle::new(store)),
        )
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(self, client: reqwest::Client) -> Self {
        Self::assemble(self.config, client, self.lifecycle)
    }

    fn assemble(
        config: Arc<ClientConfig>,
        http: reqwest::Client,
        lifecycle: Arc<SessionLifecycle>,
    ) -> Self {
        let pipeline = RequestPipeline::new(http, Arc::clone(&config), Arc::clone(&lifecycle));
        Self {
            config,
            lifecycle,
            pipeline,
        }
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Session lifecycle shared with the pipeline.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<SessionLifecycle> {
        &self.lifecycle
    }

    /// Authenticated request pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// Snapshot of the current session.
    #[must_use]
    pub fn session(&self) -> Session {
        self.lifecycle.store().get()
    }

    /// Whether a token and principal are held.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.lifecycle.is_authenticated()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Receiver that observes lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.watch_state()
    }

    /// Navigation signals: established / ended (logged out or expired).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.lifecycle.subscribe()
    }

    /// Adopt the persisted session, if any. No network I/O.
    pub fn restore_from_persistence(&self) -> bool {
        self.lifecycle.restore_from_persistence()
    }

    /// Log in and establish a session.
    ///
    /// On success emits [`SessionEvent::Established`] carrying `redirect`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCredentials`] with the server's message if the login was
    ///   rejected. The current session is left as it was.
    /// - [`Error::RequestFailed`] on a server error, [`Error::Http`] on network failure.
    pub async fn login(
        &self,
        credentials: &LoginCredentials,
        redirect: Option<String>,
    ) -> Result<Principal, Error> {
        self.lifecycle.begin_authenticating();

        match self.login_exchange(credentials).await {
            Ok(response) => {
                let principal = response.user.clone();
                self.lifecycle.establish(
                    CredentialPair::new(response.access_token, response.refresh_token),
                    response.user,
                    redirect,
                );
                tracing::info!(principal_id = %principal.id, role = %principal.role, "Login successful");
                Ok(principal)
            }
            Err(e) => {
                self.lifecycle.abort_authenticating();
                tracing::warn!(identifier = %credentials.identifier(), error = %e, "Login failed");
                Err(e)
            }
        }
    }

    async fn login_exchange(&self, credentials: &LoginCredentials) -> Result<LoginResponse, Error> {
        let request = ApiRequest::post(self.config.login_path()).json(credentials)?;
        let response = self.pipeline.send_unauthenticated(&request).await?;

        if response.status().is_success() {
            return response.json::<LoginResponse>().await.map_err(Into::into);
        }

        let (status, body) = read_failure(response).await;
        if (400..500).contains(&status) {
            Err(Error::InvalidCredentials(body.describe(DEFAULT_LOGIN_ERROR)))
        } else {
            Err(Error::RequestFailed {
                operation: "login".into(),
                status,
                detail: body.describe(DEFAULT_LOGIN_ERROR),
            })
        }
    }

    /// Register a new account. Does not log in; chain [`login`](Self::login) if wanted.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] with per-field messages if the server rejected the payload.
    /// - [`Error::RequestFailed`] on a server error, [`Error::Http`] on network failure.
    pub async fn register<P: Serialize + ?Sized>(&self, payload: &P) -> Result<Registration, Error> {
        let request = ApiRequest::post(self.config.register_path()).json(payload)?;
        let response = self.pipeline.send_unauthenticated(&request).await?;

        if response.status().is_success() {
            let registration = response.json::<Registration>().await?;
            tracing::info!(
                principal_id = ?registration.user.as_ref().map(|u| u.id),
                "Registration successful"
            );
            return Ok(registration);
        }

        let (status, body) = read_failure(response).await;
        if (400..500).contains(&status) {
            let fields = body.field_errors();
            tracing::warn!(status, fields = fields.len(), "Registration rejected");
            Err(Error::Validation {
                message: body.describe(DEFAULT_REGISTER_ERROR),
                fields,
            })
        } else {
            Err(Error::RequestFailed {
                operation: "register".into(),
                status,
                detail: body.describe(DEFAULT_REGISTER_ERROR),
            })
        }
    }

    /// Clear the session and emit `Ended { LoggedOut }`.
    pub fn logout(&self) {
        self.lifecycle.logout();
    }

    /// Fetch the authenticated principal and refresh the stored copy.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch), plus [`Error::Http`] if the body
    /// does not carry a `user`.
    pub async fn current_principal(&self) -> Result<Principal, Error> {
        let current: CurrentPrincipal = self
            .send_json(ApiRequest::get(self.config.me_path()))
            .await?;
        if !self.lifecycle.store().replace_principal(current.user.clone()) {
            tracing::debug!("Session ended before principal arrived; not storing it");
        }
        Ok(current.user)
    }

    /// Send a request through the authenticated pipeline.
    ///
    /// # Errors
    ///
    /// See [`RequestPipeline::dispatch`].
    pub async fn dispatch(&self, request: ApiRequest) -> Result<reqwest::Response, Error> {
        self.pipeline.dispatch(request).await
    }

    /// Dispatch and decode a JSON response body.
    ///
    /// # Errors
    ///
    /// See [`RequestPipeline::dispatch`]; [`Error::Http`] if the body does not decode.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, Error> {
        let response = self.pipeline.dispatch(request).await?;
        response.json::<T>().await.map_err(Into::into)
    }

    /// `GET path` and decode the JSON body.
    ///
    /// # Errors
    ///
    /// See [`send_json`](Self::send_json).
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        self.send_json(ApiRequest::get(path)).await
    }

    /// `POST path` with a JSON body and decode the JSON response.
    ///
    /// # Errors
    ///
    /// See [`send_json`](Self::send_json); [`Error::Json`] if `body` does not serialize.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::post(path).json(body)?).await
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("config", &self.config)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::lifecycle::EndReason;
    use crate::storage::MemoryStorage;
    use crate::types::Role;

    fn client(server: &MockServer) -> AuthClient {
        let config = ClientConfig::new(format!("{}/api", server.uri()).parse().unwrap());
        AuthClient::new(config, MemoryStorage::new())
    }

    fn login_ok() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "A",
            "refresh_token": "R",
            "user": {"id": 5, "display_name": "Ace", "role": "cadre"}
        }))
    }

    #[test]
    fn login_credentials_hide_secret() {
        let creds = LoginCredentials::new("0912345678", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
        assert_eq!(
            serde_json::to_value(&creds).unwrap(),
            json!({"username": "0912345678", "password": "hunter2"})
        );
    }

    #[tokio::test]
    async fn login_establishes_session_and_signals() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .and(body_json(json!({"username": "0912345678", "password": "pw"})))
            .respond_with(login_ok())
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let mut events = client.subscribe();

        let principal = client
            .login(&LoginCredentials::new("0912345678", "pw"), Some("/matches".into()))
            .await
            .unwrap();

        assert_eq!(principal.role, Role::Cadre);
        assert!(client.is_authenticated());
        assert_eq!(client.state(), LifecycleState::Authenticated);
        assert_eq!(client.session().refresh_token().unwrap().as_str(), "R");
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Established {
                redirect: Some("/matches".into())
            }
        );
    }

    #[tokio::test]
    async fn login_accepts_backend_user_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": "Login successful",
                "access_token": "A",
                "refresh_token": "R",
                "user": {
                    "id": 12,
                    "username": "0912345678",
                    "email": null,
                    "display_name": "Ming",
                    "role": "member",
                    "created_at": "2024-03-01T08:30:00.123456"
                }
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let principal = client
            .login(&LoginCredentials::new("0912345678", "pw"), None)
            .await
            .unwrap();

        assert_eq!(principal.role, Role::Player);
        assert!(principal.created_at.is_some());
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn login_tolerates_missing_role() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A",
                "user": {"id": 13, "username": "guest1", "role": null, "created_at": null}
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let principal = client
            .login(&LoginCredentials::new("guest1", "pw"), None)
            .await
            .unwrap();
        assert_eq!(principal.role, Role::Guest);
    }

    #[tokio::test]
    async fn rejected_login_surfaces_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_credentials",
                "message": "Wrong account or password"
            })))
            .mount(&server)
            .await;
        Mock::given(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server);
        let err = client
            .login(&LoginCredentials::new("x", "y"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidCredentials(ref m) if m == "Wrong account or password"));
        assert!(!client.is_authenticated());
        assert_eq!(client.state(), LifecycleState::Unauthenticated);
    }

    #[tokio::test]
    async fn login_server_error_is_request_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "login_failed"})))
            .mount(&server)
            .await;

        let client = client(&server);
        let err = client
            .login(&LoginCredentials::new("x", "y"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestFailed { status: 500, .. }));
    }

    #[tokio::test]
    async fn register_does_not_establish_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "access_token": "A",
                "refresh_token": "R",
                "user": {"id": 11, "role": "player"},
                "initial_password_warning": "Your initial password is your phone number"
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let registration = client
            .register(&json!({"phone_number": "0912345678"}))
            .await
            .unwrap();

        assert_eq!(registration.user.unwrap().id.0, 11);
        assert!(registration.initial_password_warning.is_some());
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn register_validation_errors_carry_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/register"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "validation_error",
                "message": "Invalid input",
                "details": {"phone_number": ["Not a valid phone number."]}
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let err = client
            .register(&json!({"phone_number": "12"}))
            .await
            .unwrap_err();

        match err {
            Error::Validation { message, fields } => {
                assert_eq!(message, "Invalid input");
                assert_eq!(fields["phone_number"], vec!["Not a valid phone number.".to_owned()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn current_principal_updates_stored_copy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(login_ok())
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .and(header("authorization", "Bearer A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user": {"id": 5, "display_name": "Ace Smash", "role": "coach"}
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        client
            .login(&LoginCredentials::new("a", "b"), None)
            .await
            .unwrap();

        let principal = client.current_principal().await.unwrap();
        assert!(principal.is_coach());
        assert_eq!(
            client.session().principal().unwrap().display_label(),
            "Ace Smash"
        );
    }

    #[tokio::test]
    async fn logout_emits_logged_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(login_ok())
            .mount(&server)
            .await;

        let client = client(&server);
        client
            .login(&LoginCredentials::new("a", "b"), None)
            .await
            .unwrap();
        let mut events = client.subscribe();

        client.logout();

        assert!(!client.is_authenticated());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ended {
                reason: EndReason::LoggedOut
            }
        );
    }

    #[tokio::test]
    async fn post_json_round_trips_through_pipeline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/matches"))
            .and(body_json(json!({"winner": 5})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42})))
            .mount(&server)
            .await;

        let client = client(&server);
        let created: serde_json::Value = client
            .post_json("matches", &json!({"winner": 5}))
            .await
            .unwrap();
        assert_eq!(created["id"], 42);
    }
}

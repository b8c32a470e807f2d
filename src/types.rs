use derive_more::{Display, From, Into};
use serde::{Deserialize, Deserializer, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Short-lived bearer credential attached to every authenticated request.
///
/// Opaque to the client: never parsed, never validated locally.
/// `Debug` is redacted so tokens do not end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

impl From<&str> for AccessToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Longer-lived credential used only to mint a new [`AccessToken`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct RefreshToken(String);

impl RefreshToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RefreshToken(***)")
    }
}

impl From<&str> for RefreshToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Access token plus the (optional) refresh token issued with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
}

impl CredentialPair {
    #[must_use]
    pub fn new(access_token: AccessToken, refresh_token: Option<RefreshToken>) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }
}

/// Server-side user identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct PrincipalId(pub i64);

/// Role of the authenticated user. Drives UI decisions only.
///
/// Decoding is lenient: the backend sends either the enum value (`"member"`)
/// or its name (`"MEMBER"`), and `null` for users without a role. Anything
/// unrecognized reads as [`Role::Guest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Role {
    #[default]
    Guest,
    Player,
    Cadre,
    Coach,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Player => "player",
            Self::Cadre => "cadre",
            Self::Coach => "coach",
            Self::Admin => "admin",
        }
    }
}

impl Role {
    fn from_wire(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "player" | "member" => Self::Player,
            "cadre" => Self::Cadre,
            "coach" => Self::Coach,
            "admin" => Self::Admin,
            _ => Self::Guest,
        }
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map_or(Self::Guest, Self::from_wire))
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive record of the authenticated user.
///
/// Not security-sensitive: the server re-checks every permission. Persisted as
/// JSON under the `user` storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Principal {
    pub id: PrincipalId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(
        default,
        serialize_with = "time::serde::rfc3339::option::serialize",
        deserialize_with = "lenient_timestamp"
    )]
    pub created_at: Option<OffsetDateTime>,
}

impl Principal {
    /// Create a principal with only the required `id`.
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self {
            id: PrincipalId(id),
            username: None,
            email: None,
            display_name: None,
            role: Role::default(),
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    #[must_use]
    pub fn is_cadre(&self) -> bool {
        self.role == Role::Cadre
    }

    #[must_use]
    pub fn is_coach(&self) -> bool {
        self.role == Role::Coach
    }

    /// Name to show in the UI: display name, then username, then the numeric id.
    #[must_use]
    pub fn display_label(&self) -> String {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.username.as_deref().filter(|s| !s.is_empty()))
            .map_or_else(|| format!("#{}", self.id), str::to_owned)
    }
}

/// RFC 3339, else a naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` taken as UTC, else `None`.
///
/// The backend stores naive local timestamps, so an offset is often missing.
/// A timestamp it cannot read never fails the surrounding payload.
fn lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<OffsetDateTime>, D::Error> {
    let Some(serde_json::Value::String(raw)) = Option::<serde_json::Value>::deserialize(deserializer)?
    else {
        return Ok(None);
    };
    Ok(parse_timestamp(&raw))
}

fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    PrimitiveDateTime::parse(
        raw,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    )
    .or_else(|_| {
        PrimitiveDateTime::parse(
            raw,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        )
    })
    .ok()
    .map(PrimitiveDateTime::assume_utc)
}

/// Snapshot of the process-wide session held by the credential store.
///
/// Authenticated exactly when both an access token and a principal are present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub(crate) credentials: Option<CredentialPair>,
    pub(crate) principal: Option<Principal>,
}

impl Session {
    /// A session with no credentials and no principal.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn established(credentials: CredentialPair, principal: Principal) -> Self {
        Self {
            credentials: Some(credentials),
            principal: Some(principal),
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some() && self.principal.is_some()
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&AccessToken> {
        self.credentials.as_ref().map(|c| &c.access_token)
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&RefreshToken> {
        self.credentials.as_ref().and_then(|c| c.refresh_token.as_ref())
    }

    #[must_use]
    pub fn credentials(&self) -> Option<&CredentialPair> {
        self.credentials.as_ref()
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.principal.as_ref().map(|p| p.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_redacted_in_debug() {
        let access = AccessToken::new("secret-access");
        let refresh = RefreshToken::new("secret-refresh");
        assert_eq!(format!("{access:?}"), "AccessToken(***)");
        assert!(!format!("{refresh:?}").contains("secret"));
        assert_eq!(access.as_str(), "secret-access");
    }

    #[test]
    fn principal_parses_backend_payload() {
        let json = r#"{
            "id": 7,
            "username": "0912345678",
            "email": "ace@example.com",
            "display_name": "Ace",
            "role": "coach",
            "created_at": "2024-03-01T08:30:00Z"
        }"#;
        let principal: Principal = serde_json::from_str(json).unwrap();
        assert_eq!(principal.id, PrincipalId(7));
        assert!(principal.is_coach());
        assert_eq!(principal.display_label(), "Ace");
        assert!(principal.created_at.is_some());
    }

    #[test]
    fn member_role_maps_to_player() {
        let principal: Principal = serde_json::from_str(r#"{"id": 1, "role": "member"}"#).unwrap();
        assert_eq!(principal.role, Role::Player);
        assert_eq!(principal.role.to_string(), "player");
    }

    #[test]
    fn naive_backend_timestamp_is_read_as_utc() {
        let principal: Principal = serde_json::from_str(
            r#"{"id": 3, "role": "cadre", "created_at": "2024-03-01T08:30:00.123456"}"#,
        )
        .unwrap();
        let created = principal.created_at.unwrap();
        assert_eq!(created.offset(), time::UtcOffset::UTC);
        assert_eq!(created.hour(), 8);
        assert_eq!(created.microsecond(), 123_456);

        let whole_seconds: Principal =
            serde_json::from_str(r#"{"id": 3, "created_at": "2024-03-01T08:30:00"}"#).unwrap();
        assert!(whole_seconds.created_at.is_some());
    }

    #[test]
    fn unreadable_timestamp_does_not_fail_principal() {
        let principal: Principal =
            serde_json::from_str(r#"{"id": 3, "created_at": "last tuesday"}"#).unwrap();
        assert!(principal.created_at.is_none());

        let principal: Principal =
            serde_json::from_str(r#"{"id": 3, "created_at": null}"#).unwrap();
        assert!(principal.created_at.is_none());
    }

    #[test]
    fn timestamp_survives_storage_round_trip() {
        let principal: Principal =
            serde_json::from_str(r#"{"id": 3, "created_at": "2024-03-01T08:30:00"}"#).unwrap();
        let stored = serde_json::to_string(&principal).unwrap();
        let restored: Principal = serde_json::from_str(&stored).unwrap();
        assert_eq!(restored.created_at, principal.created_at);
    }

    #[test]
    fn null_uppercase_and_unknown_roles_decode() {
        let null_role: Principal = serde_json::from_str(r#"{"id": 1, "role": null}"#).unwrap();
        assert_eq!(null_role.role, Role::Guest);

        let by_name: Principal = serde_json::from_str(r#"{"id": 1, "role": "ADMIN"}"#).unwrap();
        assert!(by_name.is_admin());

        let unknown: Principal = serde_json::from_str(r#"{"id": 1, "role": "referee"}"#).unwrap();
        assert_eq!(unknown.role, Role::Guest);
    }

    #[test]
    fn missing_role_defaults_to_guest() {
        let principal: Principal = serde_json::from_str(r#"{"id": 2}"#).unwrap();
        assert_eq!(principal.role, Role::Guest);
        assert_eq!(principal.display_label(), "#2");
    }

    #[test]
    fn display_label_falls_back_to_username() {
        let principal = Principal::new(3).with_username("smash");
        assert_eq!(principal.display_label(), "smash");
    }

    #[test]
    fn session_authenticated_needs_token_and_principal() {
        assert!(!Session::empty().is_authenticated());

        let session = Session::established(
            CredentialPair::new("a".into(), None),
            Principal::new(1).with_role(Role::Admin),
        );
        assert!(session.is_authenticated());
        assert_eq!(session.role(), Some(Role::Admin));
        assert!(session.refresh_token().is_none());

        let no_principal = Session {
            credentials: Some(CredentialPair::new("a".into(), None)),
            principal: None,
        };
        assert!(!no_principal.is_authenticated());
    }
}

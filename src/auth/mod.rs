//! Caller authentication.
//!
//! Flow Overview:
//! 1) The session cookie is tried first: the store validates (and touches)
//!    the session, then the owner's profile is loaded.
//! 2) Only when the session path yields nothing is `Authorization: Bearer`
//!    tried: the identity provider verifies the token and the subject's
//!    profile is loaded.
//! 3) When both fail the request is rejected with both reasons attached.
//!
//! Calls to the identity provider and profile store are bounded by the
//! authenticator's deadline. Role and status checks are plain predicates on
//! the resolved [`Identity`].

mod guard;

pub use guard::{enforce, refresh_session_cookie, AuthMode, Guard};

use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::Serialize;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::GatewayError,
    identity::{
        AccountStatus, AuthProvider, AuthSource, Identity, ProfileError, ProfileStore,
        ProviderError, Role,
    },
    session::{CookieConfig, SessionError, SessionStore},
};

const DEFAULT_AUTH_TIMEOUT_SECONDS: u64 = 5;

/// Why one authentication path produced no identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    MissingCredentials,
    MalformedHeader,
    InvalidToken,
    SessionNotFound,
    SessionExpired,
    ProfileLookupFailed,
}

impl AuthFailure {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::MalformedHeader => "malformed_authorization_header",
            Self::InvalidToken => "invalid_token",
            Self::SessionNotFound => "session_not_found",
            Self::SessionExpired => "session_expired",
            Self::ProfileLookupFailed => "profile_lookup_failed",
        }
    }

    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::MissingCredentials => "No credentials were provided",
            Self::MalformedHeader => "Authorization header must use the Bearer scheme",
            Self::InvalidToken => "Token is invalid or expired",
            Self::SessionNotFound => "Session not found",
            Self::SessionExpired => "Session expired",
            Self::ProfileLookupFailed => "Unable to load user profile",
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl From<AuthFailure> for GatewayError {
    fn from(failure: AuthFailure) -> Self {
        Self::Unauthorized(failure)
    }
}

pub struct Authenticator {
    sessions: Arc<SessionStore>,
    provider: Arc<dyn AuthProvider>,
    profiles: Arc<dyn ProfileStore>,
    cookies: CookieConfig,
    timeout: Duration,
}

impl Authenticator {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStore>,
        provider: Arc<dyn AuthProvider>,
        profiles: Arc<dyn ProfileStore>,
        cookies: CookieConfig,
    ) -> Self {
        Self {
            sessions,
            provider,
            profiles,
            cookies,
            timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECONDS),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn AuthProvider> {
        &self.provider
    }

    #[must_use]
    pub fn profiles(&self) -> &Arc<dyn ProfileStore> {
        &self.profiles
    }

    #[must_use]
    pub fn cookies(&self) -> &CookieConfig {
        &self.cookies
    }

    /// Resolve the caller from the session cookie.
    ///
    /// # Errors
    /// The reason the session path failed.
    pub async fn from_session(&self, headers: &HeaderMap) -> Result<Identity, AuthFailure> {
        let session_id = self
            .cookies
            .extract(headers)
            .ok_or(AuthFailure::MissingCredentials)?;

        let session = self
            .sessions
            .validate(&session_id)
            .await
            .map_err(|err| match err {
                SessionError::Expired => AuthFailure::SessionExpired,
                _ => AuthFailure::SessionNotFound,
            })?;

        let source = AuthSource::Session {
            session_id: session.id,
            expires_at: session.expires_at,
        };
        self.load_identity(session.user_id, source).await
    }

    /// Resolve the caller from `Authorization: Bearer <token>`.
    ///
    /// The scheme must be exactly `Bearer ` (case-sensitive, one space); any
    /// other shape fails without contacting the provider.
    ///
    /// # Errors
    /// The reason the bearer path failed.
    pub async fn from_bearer(&self, headers: &HeaderMap) -> Result<Identity, AuthFailure> {
        let token = bearer_token(headers)?;

        let verified = tokio::time::timeout(self.timeout, self.provider.verify_token(token))
            .await
            .map_err(|_| {
                warn!("token verification timed out");
                AuthFailure::InvalidToken
            })?
            .map_err(|err| {
                match &err {
                    ProviderError::Unavailable(detail) => {
                        warn!("identity provider unavailable: {detail}");
                    }
                    _ => debug!("bearer token rejected: {err}"),
                }
                AuthFailure::InvalidToken
            })?;

        self.load_identity(verified.subject, AuthSource::Bearer)
            .await
    }

    /// Session first, bearer second.
    ///
    /// # Errors
    /// `Unauthenticated` carrying both failure reasons.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, GatewayError> {
        let session = match self.from_session(headers).await {
            Ok(identity) => return Ok(identity),
            Err(failure) => failure,
        };
        let bearer = match self.from_bearer(headers).await {
            Ok(identity) => return Ok(identity),
            Err(failure) => failure,
        };
        debug!(session = %session, bearer = %bearer, "authentication failed");
        Err(GatewayError::Unauthenticated { session, bearer })
    }

    /// Like [`Self::authenticate`] but absence of an identity is not an error.
    pub async fn authenticate_optional(&self, headers: &HeaderMap) -> Option<Identity> {
        self.authenticate(headers).await.ok()
    }

    async fn load_identity(
        &self,
        user_id: Uuid,
        source: AuthSource,
    ) -> Result<Identity, AuthFailure> {
        let profile = tokio::time::timeout(self.timeout, self.profiles.get_by_user_id(user_id))
            .await
            .map_err(|_| {
                warn!(user_id = %user_id, "profile lookup timed out");
                AuthFailure::ProfileLookupFailed
            })?
            .map_err(|err| {
                match &err {
                    ProfileError::NotFound => debug!(user_id = %user_id, "no profile for subject"),
                    _ => warn!(user_id = %user_id, "profile lookup failed: {err}"),
                }
                AuthFailure::ProfileLookupFailed
            })?;

        Ok(Identity::from_profile(profile, source))
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("cookies", &self.cookies)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthFailure> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthFailure::MissingCredentials)?;
    let value = value.to_str().map_err(|_| AuthFailure::MalformedHeader)?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or(AuthFailure::MalformedHeader)?;
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(AuthFailure::MalformedHeader);
    }
    Ok(token)
}

/// # Errors
/// `InsufficientPermissions` when the caller's role is not in `allowed`.
pub fn require_role(identity: &Identity, allowed: &[Role]) -> Result<(), GatewayError> {
    if allowed.contains(&identity.role) {
        Ok(())
    } else {
        Err(GatewayError::InsufficientPermissions)
    }
}

/// # Errors
/// `AccountNotActive` when the caller's status is not in `allowed`.
pub fn require_status(identity: &Identity, allowed: &[AccountStatus]) -> Result<(), GatewayError> {
    if allowed.contains(&identity.status) {
        Ok(())
    } else {
        Err(GatewayError::AccountNotActive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        identity::{MemoryProfileStore, Profile, StaticAuthProvider},
        session::SessionConfig,
    };
    use axum::http::{header::COOKIE, HeaderValue};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn profile(role: Role) -> Profile {
        let now = Utc::now();
        Profile {
            user_id: Uuid::new_v4(),
            email: format!("{}@example.com", role.as_str()),
            display_name: None,
            role,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    struct Fixture {
        auth: Authenticator,
        session_user: Profile,
        bearer_user: Profile,
        orphan: Uuid,
    }

    fn fixture() -> Fixture {
        let session_user = profile(Role::Member);
        let bearer_user = profile(Role::Viewer);
        let orphan = Uuid::new_v4();
        let provider = StaticAuthProvider::new()
            .with_token("viewer-token", bearer_user.user_id)
            .with_token("orphan-token", orphan);
        let profiles = MemoryProfileStore::new()
            .with_profile(session_user.clone())
            .with_profile(bearer_user.clone());
        let sessions = Arc::new(SessionStore::new(
            SessionConfig::new(),
            Arc::new(ManualClock::default()),
        ));
        Fixture {
            auth: Authenticator::new(
                sessions,
                Arc::new(provider),
                Arc::new(profiles),
                CookieConfig::new(),
            ),
            session_user,
            bearer_user,
            orphan,
        }
    }

    async fn session_for(auth: &Authenticator, user: Uuid) -> Result<String, SessionError> {
        let session = auth
            .sessions()
            .create(user, chrono::Duration::hours(1), BTreeMap::new())
            .await?;
        Ok(session.id)
    }

    fn headers(cookie: Option<&str>, authorization: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(id) = cookie {
            if let Ok(value) = HeaderValue::from_str(&format!("portero_session={id}")) {
                headers.insert(COOKIE, value);
            }
        }
        if let Some(value) = authorization {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    #[tokio::test]
    async fn session_wins_over_bearer() -> anyhow::Result<()> {
        let fx = fixture();
        let sid = session_for(&fx.auth, fx.session_user.user_id).await?;

        let identity = fx
            .auth
            .authenticate(&headers(Some(&sid), Some("Bearer viewer-token")))
            .await?;
        assert_eq!(identity.user_id, fx.session_user.user_id);
        assert_eq!(identity.session_id(), Some(sid.as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn falls_back_to_bearer_when_session_is_unknown() {
        let fx = fixture();
        let identity = fx
            .auth
            .authenticate(&headers(Some("stale"), Some("Bearer viewer-token")))
            .await
            .ok();
        assert_eq!(identity.as_ref().map(|i| i.user_id), Some(fx.bearer_user.user_id));
        assert_eq!(identity.map(|i| i.source), Some(AuthSource::Bearer));
    }

    #[tokio::test]
    async fn both_reasons_are_reported() {
        let fx = fixture();
        let err = fx
            .auth
            .authenticate(&headers(Some("stale"), Some("Token abc")))
            .await
            .err();
        assert!(matches!(
            err,
            Some(GatewayError::Unauthenticated {
                session: AuthFailure::SessionNotFound,
                bearer: AuthFailure::MalformedHeader,
            })
        ));
    }

    #[tokio::test]
    async fn bearer_scheme_is_case_sensitive() {
        let fx = fixture();
        for header in ["bearer viewer-token", "Bearer  viewer-token", "Bearer ", "Basic abc"] {
            assert_eq!(
                fx.auth.from_bearer(&headers(None, Some(header))).await.err(),
                Some(AuthFailure::MalformedHeader),
                "{header}"
            );
        }
        assert_eq!(
            fx.auth.from_bearer(&HeaderMap::new()).await.err(),
            Some(AuthFailure::MissingCredentials)
        );
    }

    #[tokio::test]
    async fn unknown_token_and_missing_profile() -> Result<(), SessionError> {
        let fx = fixture();
        assert_eq!(
            fx.auth
                .from_bearer(&headers(None, Some("Bearer nope")))
                .await
                .err(),
            Some(AuthFailure::InvalidToken)
        );
        assert_eq!(
            fx.auth
                .from_bearer(&headers(None, Some("Bearer orphan-token")))
                .await
                .err(),
            Some(AuthFailure::ProfileLookupFailed)
        );
        let sid = session_for(&fx.auth, fx.orphan).await?;
        assert_eq!(
            fx.auth.from_session(&headers(Some(&sid), None)).await.err(),
            Some(AuthFailure::ProfileLookupFailed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn optional_mode_never_fails() {
        let fx = fixture();
        assert!(fx
            .auth
            .authenticate_optional(&HeaderMap::new())
            .await
            .is_none());
        assert!(fx
            .auth
            .authenticate_optional(&headers(None, Some("Bearer viewer-token")))
            .await
            .is_some());
    }

    #[test]
    fn role_and_status_predicates() {
        let identity = Identity::from_profile(profile(Role::Viewer), AuthSource::Bearer);
        assert!(require_role(&identity, &[Role::Viewer, Role::Member]).is_ok());
        assert!(matches!(
            require_role(&identity, &[Role::Admin]),
            Err(GatewayError::InsufficientPermissions)
        ));
        assert!(require_status(&identity, &[AccountStatus::Active]).is_ok());
        assert!(matches!(
            require_status(&identity, &[AccountStatus::Suspended]),
            Err(GatewayError::AccountNotActive)
        ));
    }
}

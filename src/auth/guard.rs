use axum::{
    extract::{Request, State},
    http::{header::SET_COOKIE, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use super::{require_role, require_status, Authenticator};
use crate::{
    error::GatewayError,
    identity::{AccountStatus, AuthSource, Identity, Role},
    session::CookieConfig,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// Only `Authorization: Bearer`.
    Bearer,
    /// Only the session cookie.
    Session,
    /// Session first, then bearer.
    Either,
    /// Attach an identity when one resolves; never reject.
    Optional,
}

/// Route guard: resolves the caller, applies role and status checks and
/// stores the [`Identity`] in the request extensions.
#[derive(Clone, Debug)]
pub struct Guard {
    authenticator: Arc<Authenticator>,
    mode: AuthMode,
    roles: Vec<Role>,
    statuses: Vec<AccountStatus>,
}

impl Guard {
    #[must_use]
    pub fn new(authenticator: Arc<Authenticator>, mode: AuthMode) -> Self {
        Self {
            authenticator,
            mode,
            roles: Vec::new(),
            statuses: Vec::new(),
        }
    }

    #[must_use]
    pub fn bearer(authenticator: Arc<Authenticator>) -> Self {
        Self::new(authenticator, AuthMode::Bearer)
    }

    #[must_use]
    pub fn session(authenticator: Arc<Authenticator>) -> Self {
        Self::new(authenticator, AuthMode::Session)
    }

    #[must_use]
    pub fn either(authenticator: Arc<Authenticator>) -> Self {
        Self::new(authenticator, AuthMode::Either)
    }

    #[must_use]
    pub fn optional(authenticator: Arc<Authenticator>) -> Self {
        Self::new(authenticator, AuthMode::Optional)
    }

    /// Restrict to callers holding one of `roles`.
    #[must_use]
    pub fn with_roles(mut self, roles: &[Role]) -> Self {
        self.roles = roles.to_vec();
        self
    }

    /// Restrict to callers whose account is in one of `statuses`.
    #[must_use]
    pub fn with_statuses(mut self, statuses: &[AccountStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// # Errors
    /// Authentication or authorization failure for this guard's policy.
    pub async fn check(&self, headers: &HeaderMap) -> Result<Option<Identity>, GatewayError> {
        let identity = match self.mode {
            AuthMode::Optional => {
                return Ok(self.authenticator.authenticate_optional(headers).await);
            }
            AuthMode::Bearer => self.authenticator.from_bearer(headers).await?,
            AuthMode::Session => self.authenticator.from_session(headers).await?,
            AuthMode::Either => self.authenticator.authenticate(headers).await?,
        };

        if !self.statuses.is_empty() {
            require_status(&identity, &self.statuses)?;
        }
        if !self.roles.is_empty() {
            require_role(&identity, &self.roles)?;
        }
        Ok(Some(identity))
    }
}

/// Middleware entry point, used with `axum::middleware::from_fn_with_state`.
pub async fn enforce(State(guard): State<Guard>, mut request: Request, next: Next) -> Response {
    let identity = match guard.check(request.headers()).await {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };

    let Some(identity) = identity else {
        return next.run(request).await;
    };

    request.extensions_mut().insert(identity.clone());
    let mut response = next.run(request).await;
    let now = guard.authenticator.sessions().now();
    refresh_session_cookie(&mut response, &identity, guard.authenticator.cookies(), now);
    response
}

/// Re-issue the session cookie with the session's current remaining lifetime.
///
/// Skipped for bearer callers and when the response already sets the gateway
/// cookie (login, logout). Other `Set-Cookie` headers are kept.
pub fn refresh_session_cookie(
    response: &mut Response,
    identity: &Identity,
    cookies: &CookieConfig,
    now: DateTime<Utc>,
) {
    let AuthSource::Session {
        session_id,
        expires_at,
    } = &identity.source
    else {
        return;
    };
    if sets_cookie(response.headers(), cookies.name()) {
        return;
    }

    let max_age = (*expires_at - now).num_seconds();
    match cookies.session_cookie(session_id, max_age) {
        Ok(cookie) => {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        Err(err) => warn!("Failed to build session cookie: {err}"),
    }
}

fn sets_cookie(headers: &HeaderMap, name: &str) -> bool {
    headers.get_all(SET_COOKIE).iter().any(|value| {
        value
            .to_str()
            .ok()
            .and_then(|cookie| cookie.split_once('='))
            .is_some_and(|(cookie_name, _)| cookie_name.trim() == name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        identity::{MemoryProfileStore, Profile, StaticAuthProvider},
        session::{SessionConfig, SessionStore},
    };
    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, header::COOKIE, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
        Extension, Router,
    };
    use anyhow::{Context, Result};
    use std::collections::BTreeMap;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn profile(role: Role, status: AccountStatus) -> Profile {
        let now = Utc::now();
        Profile {
            user_id: Uuid::new_v4(),
            email: "user@example.com".to_string(),
            display_name: None,
            role,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    fn authenticator(profiles: Vec<(&'static str, Profile)>) -> Arc<Authenticator> {
        let mut provider = StaticAuthProvider::new();
        let mut store = MemoryProfileStore::new();
        for (token, profile) in profiles {
            provider = provider.with_token(token, profile.user_id);
            store = store.with_profile(profile);
        }
        let sessions = Arc::new(SessionStore::new(
            SessionConfig::new(),
            Arc::new(ManualClock::default()),
        ));
        Arc::new(Authenticator::new(
            sessions,
            Arc::new(provider),
            Arc::new(store),
            CookieConfig::new(),
        ))
    }

    fn app(guard: Guard) -> Router {
        Router::new()
            .route(
                "/",
                get(|identity: Option<Extension<Identity>>| async move {
                    identity.map_or_else(
                        || "anonymous".to_string(),
                        |Extension(identity)| identity.role.to_string(),
                    )
                }),
            )
            .layer(from_fn_with_state(guard, enforce))
    }

    fn request(header: Option<(axum::http::HeaderName, String)>) -> Result<Request> {
        let mut builder = axum::http::Request::builder().uri("/");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        Ok(builder.body(Body::empty())?)
    }

    #[tokio::test]
    async fn viewer_rejected_from_admin_route() -> Result<()> {
        let auth = authenticator(vec![(
            "viewer",
            profile(Role::Viewer, AccountStatus::Active),
        )]);
        let guard = Guard::either(auth).with_roles(&[Role::Admin]);
        let response = app(guard)
            .oneshot(request(Some((AUTHORIZATION, "Bearer viewer".to_string())))?)
            .await?;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        Ok(())
    }

    #[tokio::test]
    async fn inactive_account_rejected() -> Result<()> {
        let auth = authenticator(vec![(
            "pending",
            profile(Role::Member, AccountStatus::Pending),
        )]);
        let guard = Guard::either(auth).with_statuses(&[AccountStatus::Active]);
        let response = app(guard)
            .oneshot(request(Some((AUTHORIZATION, "Bearer pending".to_string())))?)
            .await?;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        Ok(())
    }

    #[tokio::test]
    async fn optional_passes_anonymous_through() -> Result<()> {
        let auth = authenticator(Vec::new());
        let response = app(Guard::optional(auth)).oneshot(request(None)?).await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn session_mode_ignores_bearer() -> Result<()> {
        let auth = authenticator(vec![(
            "member",
            profile(Role::Member, AccountStatus::Active),
        )]);
        let response = app(Guard::session(auth))
            .oneshot(request(Some((AUTHORIZATION, "Bearer member".to_string())))?)
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn session_requests_refresh_cookie() -> Result<()> {
        let member = profile(Role::Member, AccountStatus::Active);
        let auth = authenticator(vec![("member", member.clone())]);
        let sid = auth
            .sessions()
            .create(member.user_id, chrono::Duration::hours(1), BTreeMap::new())
            .await?
            .id;

        let response = app(Guard::session(auth))
            .oneshot(request(Some((COOKIE, format!("portero_session={sid}"))))?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .context("missing set-cookie")?
            .to_str()?;
        assert!(cookie.starts_with(&format!("portero_session={sid};")));
        assert!(cookie.contains("HttpOnly"));
        Ok(())
    }

    fn session_identity(session_id: &str, expires_at: DateTime<Utc>) -> Identity {
        Identity::from_profile(
            profile(Role::Member, AccountStatus::Active),
            AuthSource::Session {
                session_id: session_id.to_string(),
                expires_at,
            },
        )
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(ToString::to_string))
            .collect()
    }

    #[test]
    fn refresh_keeps_foreign_cookies() {
        let now = Utc::now();
        let identity = session_identity("abc", now + chrono::Duration::minutes(10));
        let mut response = Response::new(Body::empty());
        response.headers_mut().append(
            SET_COOKIE,
            axum::http::HeaderValue::from_static("upstream_pref=1; Path=/"),
        );

        refresh_session_cookie(&mut response, &identity, &CookieConfig::new(), now);

        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().any(|c| c.starts_with("upstream_pref=1")));
        assert!(cookies
            .iter()
            .any(|c| c.starts_with("portero_session=abc;") && c.contains("Max-Age=600")));
    }

    #[test]
    fn refresh_leaves_gateway_cookie_alone() {
        let now = Utc::now();
        let identity = session_identity("abc", now + chrono::Duration::minutes(10));
        let mut response = Response::new(Body::empty());
        response.headers_mut().append(
            SET_COOKIE,
            axum::http::HeaderValue::from_static("portero_session=; Max-Age=0"),
        );

        refresh_session_cookie(&mut response, &identity, &CookieConfig::new(), now);

        assert_eq!(set_cookies(&response), vec!["portero_session=; Max-Age=0"]);
    }
}

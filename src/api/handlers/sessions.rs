//! Session lifecycle endpoints.
//!
//! A bearer caller exchanges its token for a session cookie with
//! `POST /v1/sessions`; every other endpoint operates on the caller's own
//! sessions only.

use super::{cookie_headers, RevokedCount, SessionList, SessionView};
use crate::{
    api::AppState,
    error::GatewayError,
    identity::Identity,
    session::{SessionError, METADATA_ROLE, METADATA_USER_AGENT},
};
use axum::{
    extract::{Extension, Path},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info};
use utoipa::ToSchema;

/// Upper bound for an explicit extension.
pub const MAX_EXTEND_SECONDS: i64 = 7 * 24 * 60 * 60;

const MAX_USER_AGENT_LEN: usize = 256;

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct ExtendRequest {
    /// New lifetime in seconds, counted from now. Defaults to the session TTL.
    pub ttl_seconds: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    responses(
        (status = 201, description = "Session created; cookie set.", body = SessionView),
        (status = 401, description = "Missing or invalid bearer token."),
    ),
    tag = "sessions"
)]
pub async fn create(
    state: Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, GatewayError> {
    let sessions = state.authenticator.sessions();

    let mut metadata = BTreeMap::new();
    metadata.insert(METADATA_ROLE.to_string(), identity.role.to_string());
    if let Some(agent) = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        let agent: String = agent.chars().take(MAX_USER_AGENT_LEN).collect();
        metadata.insert(METADATA_USER_AGENT.to_string(), agent);
    }

    let session = sessions
        .create(identity.user_id, sessions.config().default_ttl(), metadata)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

    info!(user_id = %identity.user_id, "session created");

    let max_age = session.remaining(sessions.now()).num_seconds();
    let cookie = state
        .authenticator
        .cookies()
        .session_cookie(&session.id, max_age);
    let current = session.id.clone();

    Ok((
        StatusCode::CREATED,
        cookie_headers(cookie),
        Json(SessionView::new(session, Some(&current))),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    responses(
        (status = 200, description = "The caller's live sessions.", body = SessionList),
        (status = 401, description = "Not authenticated."),
    ),
    tag = "sessions"
)]
pub async fn list(
    state: Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Json<SessionList> {
    let sessions = state
        .authenticator
        .sessions()
        .list_for_user(identity.user_id)
        .await
        .into_iter()
        .map(|session| SessionView::new(session, identity.session_id()))
        .collect();
    Json(SessionList { sessions })
}

#[utoipa::path(
    post,
    path = "/v1/sessions/extend",
    request_body(content = ExtendRequest, description = "Optional new lifetime"),
    responses(
        (status = 200, description = "Session extended; cookie refreshed.", body = SessionView),
        (status = 400, description = "ttl_seconds out of range."),
        (status = 401, description = "Missing or invalid session cookie."),
    ),
    tag = "sessions"
)]
pub async fn extend(
    state: Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    request: Option<Json<ExtendRequest>>,
) -> Result<impl IntoResponse, GatewayError> {
    let sessions = state.authenticator.sessions();
    let ttl = match request.and_then(|Json(request)| request.ttl_seconds) {
        Some(seconds) if (1..=MAX_EXTEND_SECONDS).contains(&seconds) => Duration::seconds(seconds),
        Some(_) => {
            return Err(GatewayError::Validation(format!(
                "ttl_seconds must be between 1 and {MAX_EXTEND_SECONDS}"
            )));
        }
        None => sessions.config().default_ttl(),
    };

    let Some(session_id) = identity.session_id() else {
        return Err(GatewayError::Validation(
            "session extension requires a session cookie".to_string(),
        ));
    };

    let session = sessions
        .extend(session_id, ttl)
        .await
        .map_err(|err| match err {
            SessionError::NotFound | SessionError::Expired => GatewayError::NotFound("session"),
            other => GatewayError::Internal(other.to_string()),
        })?;

    debug!(user_id = %identity.user_id, ttl_seconds = ttl.num_seconds(), "session extended");

    let cookie = state
        .authenticator
        .cookies()
        .session_cookie(&session.id, ttl.num_seconds());
    Ok((
        cookie_headers(cookie),
        Json(SessionView::new(session, Some(session_id))),
    ))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/current",
    responses(
        (status = 204, description = "Session revoked; cookie cleared."),
        (status = 401, description = "Missing or invalid session cookie."),
    ),
    tag = "sessions"
)]
pub async fn revoke_current(
    state: Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> impl IntoResponse {
    if let Some(session_id) = identity.session_id() {
        // already gone is fine, the caller is logged out either way
        let _ = state.authenticator.sessions().revoke(session_id).await;
        info!(user_id = %identity.user_id, "session revoked");
    }
    (
        StatusCode::NO_CONTENT,
        cookie_headers(state.authenticator.cookies().clear_cookie()),
    )
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{id}",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 204, description = "Session revoked."),
        (status = 401, description = "Not authenticated."),
        (status = 404, description = "No such session for this caller."),
    ),
    tag = "sessions"
)]
pub async fn revoke(
    state: Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    state
        .authenticator
        .sessions()
        .revoke_for_user(identity.user_id, &id)
        .await
        .map_err(|_| GatewayError::NotFound("session"))?;

    info!(user_id = %identity.user_id, "session revoked");

    let mut headers = HeaderMap::new();
    if identity.session_id() == Some(id.as_str()) {
        headers = cookie_headers(state.authenticator.cookies().clear_cookie());
    }
    Ok((StatusCode::NO_CONTENT, headers))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions",
    responses(
        (status = 200, description = "All of the caller's sessions revoked.", body = RevokedCount),
        (status = 401, description = "Not authenticated."),
    ),
    tag = "sessions"
)]
pub async fn revoke_all(
    state: Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> impl IntoResponse {
    let revoked = state
        .authenticator
        .sessions()
        .revoke_all_for_user(identity.user_id)
        .await;

    info!(user_id = %identity.user_id, revoked, "all sessions revoked");

    (
        cookie_headers(state.authenticator.cookies().clear_cookie()),
        Json(RevokedCount { revoked }),
    )
}

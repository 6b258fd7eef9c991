//! Operator endpoints under `/v1/admin`, guarded for active admins.

use super::{parse_user_id, RevokedCount, SessionList, SessionView};
use crate::{
    api::AppState,
    error::GatewayError,
    identity::{AccountStatus, Identity, Pagination, Profile, ProfileError, ProviderError},
};
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

const DEFAULT_PAGE_LIMIT: u32 = 20;
const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct ListUsersQuery {
    /// Page size, clamped to 1..=100.
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListUsersQuery {
    fn pagination(&self) -> Pagination {
        Pagination {
            limit: self
                .limit
                .unwrap_or(DEFAULT_PAGE_LIMIT)
                .clamp(1, MAX_PAGE_LIMIT),
            offset: self.offset.unwrap_or(0),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserPage {
    pub users: Vec<Profile>,
    pub has_more: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SuspendResponse {
    pub user: Profile,
    pub revoked_sessions: usize,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStats {
    pub sessions: usize,
    pub users_with_sessions: usize,
    pub tracked_visitors: usize,
}

#[utoipa::path(
    get,
    path = "/v1/admin/users",
    params(ListUsersQuery),
    responses(
        (status = 200, description = "A page of user profiles.", body = UserPage),
        (status = 401, description = "Not authenticated."),
        (status = 403, description = "Admin role required."),
    ),
    tag = "admin"
)]
pub async fn list_users(
    state: Extension<Arc<AppState>>,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<UserPage>, GatewayError> {
    let page = state
        .authenticator
        .profiles()
        .list(query.pagination())
        .await?;
    Ok(Json(UserPage {
        users: page.profiles,
        has_more: page.has_more,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/approve",
    params(
        ("id" = String, Path, description = "User id")
    ),
    responses(
        (status = 200, description = "User activated.", body = Profile),
        (status = 404, description = "User not found."),
        (status = 409, description = "User is already active."),
    ),
    tag = "admin"
)]
pub async fn approve_user(
    state: Extension<Arc<AppState>>,
    Extension(admin): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<Json<Profile>, GatewayError> {
    let user_id = parse_user_id(&id)?;
    let profiles = state.authenticator.profiles();

    let mut profile = profiles.get_by_user_id(user_id).await?;
    if profile.status == AccountStatus::Active {
        return Err(GatewayError::Conflict("user is already active".to_string()));
    }

    profile.status = AccountStatus::Active;
    let profile = profiles.update(profile).await?;

    info!(admin_id = %admin.user_id, user_id = %user_id, "user approved");
    Ok(Json(profile))
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/suspend",
    params(
        ("id" = String, Path, description = "User id")
    ),
    responses(
        (status = 200, description = "User suspended and logged out.", body = SuspendResponse),
        (status = 404, description = "User not found."),
        (status = 409, description = "User is already suspended, or is the caller."),
    ),
    tag = "admin"
)]
pub async fn suspend_user(
    state: Extension<Arc<AppState>>,
    Extension(admin): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<Json<SuspendResponse>, GatewayError> {
    let user_id = parse_user_id(&id)?;
    if user_id == admin.user_id {
        return Err(GatewayError::Conflict(
            "administrators cannot suspend themselves".to_string(),
        ));
    }
    let profiles = state.authenticator.profiles();

    let mut profile = profiles.get_by_user_id(user_id).await?;
    if profile.status == AccountStatus::Suspended {
        return Err(GatewayError::Conflict(
            "user is already suspended".to_string(),
        ));
    }

    profile.status = AccountStatus::Suspended;
    let user = profiles.update(profile).await?;
    let revoked_sessions = state
        .authenticator
        .sessions()
        .revoke_all_for_user(user_id)
        .await;

    info!(
        admin_id = %admin.user_id,
        user_id = %user_id,
        revoked_sessions,
        "user suspended"
    );
    Ok(Json(SuspendResponse {
        user,
        revoked_sessions,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/admin/users/{id}/sessions",
    params(
        ("id" = String, Path, description = "User id")
    ),
    responses(
        (status = 200, description = "The user's live sessions.", body = SessionList),
        (status = 400, description = "Invalid user id."),
    ),
    tag = "admin"
)]
pub async fn user_sessions(
    state: Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionList>, GatewayError> {
    let user_id = parse_user_id(&id)?;
    let sessions = state
        .authenticator
        .sessions()
        .list_for_user(user_id)
        .await
        .into_iter()
        .map(|session| SessionView::new(session, None))
        .collect();
    Ok(Json(SessionList { sessions }))
}

#[utoipa::path(
    delete,
    path = "/v1/admin/users/{id}/sessions",
    params(
        ("id" = String, Path, description = "User id")
    ),
    responses(
        (status = 200, description = "All of the user's sessions revoked.", body = RevokedCount),
        (status = 400, description = "Invalid user id."),
    ),
    tag = "admin"
)]
pub async fn revoke_user_sessions(
    state: Extension<Arc<AppState>>,
    Extension(admin): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<Json<RevokedCount>, GatewayError> {
    let user_id = parse_user_id(&id)?;
    let revoked = state
        .authenticator
        .sessions()
        .revoke_all_for_user(user_id)
        .await;
    info!(admin_id = %admin.user_id, user_id = %user_id, revoked, "user sessions revoked");
    Ok(Json(RevokedCount { revoked }))
}

#[utoipa::path(
    delete,
    path = "/v1/admin/users/{id}",
    params(
        ("id" = String, Path, description = "User id")
    ),
    responses(
        (status = 204, description = "User deleted everywhere."),
        (status = 404, description = "User not found."),
        (status = 409, description = "Administrators cannot delete themselves."),
    ),
    tag = "admin"
)]
pub async fn delete_user(
    state: Extension<Arc<AppState>>,
    Extension(admin): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let user_id = parse_user_id(&id)?;
    if user_id == admin.user_id {
        return Err(GatewayError::Conflict(
            "administrators cannot delete themselves".to_string(),
        ));
    }

    // Tolerate one side already being gone; 404 only when neither knew the user.
    let identity_deleted = match state.authenticator.provider().delete_identity(user_id).await {
        Ok(()) => true,
        Err(ProviderError::NotFound) => {
            warn!(user_id = %user_id, "identity provider has no such user");
            false
        }
        Err(err) => return Err(err.into()),
    };
    let profile_deleted = match state.authenticator.profiles().delete(user_id).await {
        Ok(()) => true,
        Err(ProfileError::NotFound) => false,
        Err(err) => return Err(err.into()),
    };
    if !identity_deleted && !profile_deleted {
        return Err(GatewayError::NotFound("user"));
    }

    let revoked = state
        .authenticator
        .sessions()
        .revoke_all_for_user(user_id)
        .await;

    info!(admin_id = %admin.user_id, user_id = %user_id, revoked, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/admin/stats",
    responses(
        (status = 200, description = "Session store and rate limiter counters.", body = GatewayStats),
    ),
    tag = "admin"
)]
pub async fn stats(state: Extension<Arc<AppState>>) -> Json<GatewayStats> {
    let sessions = state.authenticator.sessions().stats().await;
    let tracked_visitors = state.limiter.visitors().await;
    Json(GatewayStats {
        sessions: sessions.sessions,
        users_with_sessions: sessions.users,
        tracked_visitors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_limit_is_clamped() {
        let query = ListUsersQuery {
            limit: Some(1000),
            offset: Some(40),
        };
        assert_eq!(
            query.pagination(),
            Pagination {
                limit: MAX_PAGE_LIMIT,
                offset: 40
            }
        );

        let query = ListUsersQuery {
            limit: Some(0),
            offset: None,
        };
        assert_eq!(query.pagination().limit, 1);
        assert_eq!(
            ListUsersQuery::default().pagination().limit,
            DEFAULT_PAGE_LIMIT
        );
    }
}

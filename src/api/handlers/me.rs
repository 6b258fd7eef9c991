use crate::{
    api::AppState,
    error::GatewayError,
    identity::{AccountStatus, AuthSource, Identity, Role},
};
use axum::{
    extract::Extension,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MeResponse {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,
    /// `session` or `bearer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_expires_at: Option<DateTime<Utc>>,
}

impl MeResponse {
    fn anonymous() -> Self {
        Self {
            authenticated: false,
            user_id: None,
            email: None,
            role: None,
            status: None,
            auth_method: None,
            session_expires_at: None,
        }
    }

    fn from_identity(identity: Identity) -> Self {
        let (auth_method, session_expires_at) = match identity.source {
            AuthSource::Session { expires_at, .. } => ("session", Some(expires_at)),
            AuthSource::Bearer => ("bearer", None),
        };
        Self {
            authenticated: true,
            user_id: Some(identity.user_id),
            email: Some(identity.email),
            role: Some(identity.role),
            status: Some(identity.status),
            auth_method: Some(auth_method.to_string()),
            session_expires_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/me",
    responses(
        (status = 200, description = "The caller, or `authenticated: false`.", body = MeResponse),
    ),
    tag = "me"
)]
pub async fn me(identity: Option<Extension<Identity>>) -> Json<MeResponse> {
    Json(identity.map_or_else(MeResponse::anonymous, |Extension(identity)| {
        MeResponse::from_identity(identity)
    }))
}

#[derive(ToSchema, Deserialize)]
pub struct PasswordChangeRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordChangeResponse {
    /// Other sessions of the caller that were logged out.
    pub revoked_sessions: usize,
}

#[utoipa::path(
    post,
    path = "/v1/me/password",
    request_body = PasswordChangeRequest,
    responses(
        (status = 200, description = "Password changed; other sessions revoked.", body = PasswordChangeResponse),
        (status = 400, description = "Invalid input or wrong current password."),
        (status = 401, description = "Not authenticated."),
        (status = 403, description = "Account is not active."),
    ),
    tag = "me"
)]
pub async fn change_password(
    state: Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<PasswordChangeRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let PasswordChangeRequest {
        current_password,
        new_password,
    } = request;
    let current = SecretString::from(current_password);
    let new = SecretString::from(new_password);
    check_passwords(current.expose_secret(), new.expose_secret())?;

    state
        .authenticator
        .provider()
        .change_password(identity.user_id, &current, &new)
        .await?;

    let sessions = state.authenticator.sessions();
    let revoked_sessions = match identity.session_id() {
        Some(current) => sessions.revoke_others_for_user(identity.user_id, current).await,
        None => sessions.revoke_all_for_user(identity.user_id).await,
    };

    info!(user_id = %identity.user_id, revoked_sessions, "password changed");

    Ok(Json(PasswordChangeResponse { revoked_sessions }))
}

fn check_passwords(current: &str, new: &str) -> Result<(), GatewayError> {
    if current.is_empty() {
        return Err(GatewayError::Validation(
            "current_password is required".to_string(),
        ));
    }
    if new.chars().count() < MIN_PASSWORD_LEN {
        return Err(GatewayError::Validation(format!(
            "new_password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if current == new {
        return Err(GatewayError::Validation(
            "new_password must differ from current_password".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn anonymous_caller() {
        let Json(body) = me(None).await;
        assert!(!body.authenticated);
        assert_eq!(
            serde_json::to_value(&body).ok(),
            Some(serde_json::json!({"authenticated": false}))
        );
    }

    #[tokio::test]
    async fn bearer_caller_has_no_session_expiry() {
        let identity = Identity {
            user_id: Uuid::new_v4(),
            email: "ana@example.com".to_string(),
            role: Role::Member,
            status: AccountStatus::Active,
            source: AuthSource::Bearer,
        };
        let Json(body) = me(Some(Extension(identity.clone()))).await;
        assert!(body.authenticated);
        assert_eq!(body.user_id, Some(identity.user_id));
        assert_eq!(body.auth_method.as_deref(), Some("bearer"));
        assert_eq!(body.session_expires_at, None);
    }

    #[test]
    fn password_rules() {
        assert!(check_passwords("", "long enough").is_err());
        assert!(check_passwords("old-password", "short").is_err());
        assert!(check_passwords("same-password", "same-password").is_err());
        assert!(check_passwords("old-password", "new-password").is_ok());
    }
}

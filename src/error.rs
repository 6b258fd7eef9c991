//! Gateway error taxonomy and its JSON wire format.
//!
//! Every rejected request gets `{"error": <code>, "message": <text>}` with a
//! stable machine-readable code. Internal details are logged, never echoed.

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;
use utoipa::ToSchema;

use crate::{
    auth::AuthFailure,
    identity::{ProfileError, ProviderError},
    proxy::UpstreamFailure,
};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("authentication failed: {0}")]
    Unauthorized(AuthFailure),
    /// Neither the session nor the bearer path produced an identity.
    #[error("authentication required (session: {session}, bearer: {bearer})")]
    Unauthenticated {
        session: AuthFailure,
        bearer: AuthFailure,
    },
    #[error("insufficient permissions")]
    InsufficientPermissions,
    #[error("account is not active")]
    AccountNotActive,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },
    #[error("upstream unavailable: {0}")]
    ServiceUnavailable(UpstreamFailure),
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON body returned for every rejected request.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub details: Option<serde_json::Value>,
}

impl GatewayError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) | Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::InsufficientPermissions | Self::AccountNotActive => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(failure) => failure.code(),
            Self::Unauthenticated { .. } => "authentication_required",
            Self::InsufficientPermissions => "insufficient_permissions",
            Self::AccountNotActive => "account_not_active",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServiceUnavailable(failure) => failure.code(),
            Self::Internal(_) => "internal_error",
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::NotFound(what) => format!("{what} not found"),
            Self::Unauthorized(failure) => failure.message().to_string(),
            Self::Unauthenticated { .. } => "Authentication required".to_string(),
            Self::InsufficientPermissions => {
                "You do not have permission to access this resource".to_string()
            }
            Self::AccountNotActive => "Account is not active".to_string(),
            Self::Conflict(message) | Self::Validation(message) => message.clone(),
            Self::RateLimited { .. } => "Too many requests, slow down".to_string(),
            Self::ServiceUnavailable(_) => "Upstream service is unavailable".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }

    #[must_use]
    pub fn body(&self) -> ErrorBody {
        let details = match self {
            Self::Unauthenticated { session, bearer } => Some(json!({
                "session": session.code(),
                "bearer": bearer.code(),
            })),
            _ => None,
        };
        ErrorBody {
            error: self.code().to_string(),
            message: self.public_message(),
            details,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            error!("internal error: {detail}");
        }

        let status = self.status();
        let mut response = (status, Json(self.body())).into_response();
        if let Self::RateLimited {
            retry_after_seconds,
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl From<ProfileError> for GatewayError {
    fn from(err: ProfileError) -> Self {
        match err {
            ProfileError::NotFound => Self::NotFound("user"),
            ProfileError::AlreadyExists => Self::Conflict("user already exists".to_string()),
            ProfileError::Backend(detail) => Self::Internal(detail),
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidToken => Self::Unauthorized(AuthFailure::InvalidToken),
            ProviderError::NotFound => Self::NotFound("identity"),
            ProviderError::Rejected(reason) => Self::Validation(reason),
            ProviderError::Unavailable(detail) => {
                Self::Internal(format!("identity provider unavailable: {detail}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(
        err: GatewayError,
    ) -> anyhow::Result<(StatusCode, ErrorBody, Option<HeaderValue>)> {
        let response = err.into_response();
        let status = response.status();
        let retry = response.headers().get(RETRY_AFTER).cloned();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body = serde_json::from_slice(&bytes)?;
        Ok((status, body, retry))
    }

    #[tokio::test]
    async fn forbidden_codes_are_distinct() -> anyhow::Result<()> {
        let (status, body, _) = body_of(GatewayError::InsufficientPermissions).await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.error, "insufficient_permissions");

        let (status, body, _) = body_of(GatewayError::AccountNotActive).await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.error, "account_not_active");
        Ok(())
    }

    #[tokio::test]
    async fn unauthenticated_carries_both_reasons() -> anyhow::Result<()> {
        let (status, body, _) = body_of(GatewayError::Unauthenticated {
            session: AuthFailure::SessionExpired,
            bearer: AuthFailure::MissingCredentials,
        })
        .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error, "authentication_required");
        assert_eq!(
            body.details,
            Some(json!({"session": "session_expired", "bearer": "missing_credentials"}))
        );
        Ok(())
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() -> anyhow::Result<()> {
        let (status, body, retry) = body_of(GatewayError::RateLimited {
            retry_after_seconds: 2,
        })
        .await?;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.error, "rate_limited");
        assert_eq!(retry, Some(HeaderValue::from_static("2")));
        Ok(())
    }

    #[tokio::test]
    async fn internal_details_are_not_echoed() -> anyhow::Result<()> {
        let (status, body, _) =
            body_of(GatewayError::Internal("db password=hunter2".to_string())).await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "internal_error");
        assert!(!body.message.contains("hunter2"));
        Ok(())
    }

    #[tokio::test]
    async fn upstream_failures_map_to_503() -> anyhow::Result<()> {
        let (status, body, _) =
            body_of(GatewayError::ServiceUnavailable(UpstreamFailure::ConnectionRefused)).await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.error, "connection_refused");
        Ok(())
    }

    #[test]
    fn profile_and_provider_errors_map_to_taxonomy() {
        assert_eq!(GatewayError::from(ProfileError::NotFound).code(), "not_found");
        assert_eq!(GatewayError::from(ProfileError::AlreadyExists).code(), "conflict");
        assert_eq!(
            GatewayError::from(ProviderError::Rejected("wrong password".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::from(ProviderError::Unavailable("timeout".to_string())).code(),
            "internal_error"
        );
    }
}

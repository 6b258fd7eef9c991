//! Route handlers for the gateway's local API.

pub mod admin;
pub mod health;
pub mod me;
pub mod sessions;

use crate::{error::GatewayError, session::Session};
use axum::http::{header::SET_COOKIE, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Public view of a session; the token itself is only ever sent in a cookie
/// or in the create response.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionView {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub metadata: BTreeMap<String, String>,
    pub current: bool,
}

impl SessionView {
    #[must_use]
    pub fn new(session: Session, current: Option<&str>) -> Self {
        let current = current.is_some_and(|id| id == session.id);
        Self {
            id: session.id,
            created_at: session.created_at,
            expires_at: session.expires_at,
            last_used_at: session.last_used_at,
            request_count: session.request_count,
            metadata: session.metadata,
            current,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionList {
    pub sessions: Vec<SessionView>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokedCount {
    pub revoked: usize,
}

pub(crate) fn parse_user_id(raw: &str) -> Result<Uuid, GatewayError> {
    Uuid::parse_str(raw.trim()).map_err(|_| GatewayError::Validation("invalid user id".to_string()))
}

pub(crate) fn cookie_headers(cookie: Result<HeaderValue, impl std::fmt::Display>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    match cookie {
        Ok(value) => {
            headers.insert(SET_COOKIE, value);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_parsing() {
        let id = Uuid::new_v4();
        assert_eq!(parse_user_id(&id.to_string()).ok(), Some(id));
        assert!(matches!(
            parse_user_id("not-a-uuid"),
            Err(GatewayError::Validation(_))
        ));
    }
}

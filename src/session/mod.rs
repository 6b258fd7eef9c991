//! Server-side sessions: an opaque token bound to a user for a bounded window.
//!
//! Flow Overview:
//! - `SessionStore::create` mints a random token, enforcing a per-user cap by
//!   evicting the least recently used session of that user.
//! - `SessionStore::validate` is the hot path: it touches the session, bumps
//!   the request counter and transparently extends sessions past half-life.
//! - Expired sessions are removed lazily when a lookup finds them and eagerly
//!   by the reaper task.
//!
//! The store is process-local; restarting the gateway logs everyone out.

mod cookie;
mod store;

pub use cookie::{CookieConfig, SameSite};
pub use store::{SessionStats, SessionStore};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_MAX_SESSIONS_PER_USER: usize = 5;
const DEFAULT_REAP_INTERVAL_SECONDS: u64 = 5 * 60;

/// Metadata key recording the caller's role when the session was minted.
pub const METADATA_ROLE: &str = "role";
/// Metadata key recording the user agent that created the session.
pub const METADATA_USER_AGENT: &str = "user_agent";

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub id: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    /// A session is visible only while `now < expires_at`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Timestamp used for LRU eviction: last use, or creation if never used.
    #[must_use]
    pub fn recency(&self) -> DateTime<Utc> {
        self.last_used_at.unwrap_or(self.created_at)
    }

    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("session ttl must be positive")]
    InvalidTtl,
    #[error("failed to generate session token: {0}")]
    Entropy(String),
}

impl SessionError {
    /// Missing and expired sessions are the same condition to callers.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound | Self::Expired)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    default_ttl: Duration,
    max_sessions_per_user: usize,
    reap_interval: std::time::Duration,
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            default_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECONDS),
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            reap_interval: std::time::Duration::from_secs(DEFAULT_REAP_INTERVAL_SECONDS),
        }
    }

    #[must_use]
    pub fn with_default_ttl_seconds(mut self, seconds: i64) -> Self {
        self.default_ttl = Duration::seconds(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_max_sessions_per_user(mut self, max: usize) -> Self {
        self.max_sessions_per_user = max.max(1);
        self
    }

    #[must_use]
    pub fn with_reap_interval_seconds(mut self, seconds: u64) -> Self {
        self.reap_interval = std::time::Duration::from_secs(seconds.max(1));
        self
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    #[must_use]
    pub fn max_sessions_per_user(&self) -> usize {
        self.max_sessions_per_user
    }

    #[must_use]
    pub fn reap_interval(&self) -> std::time::Duration {
        self.reap_interval
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_defaults_and_overrides() {
        let config = SessionConfig::new();
        assert_eq!(
            config.default_ttl(),
            Duration::seconds(DEFAULT_SESSION_TTL_SECONDS)
        );
        assert_eq!(config.max_sessions_per_user(), DEFAULT_MAX_SESSIONS_PER_USER);

        let config = config
            .with_default_ttl_seconds(60)
            .with_max_sessions_per_user(0)
            .with_reap_interval_seconds(10);
        assert_eq!(config.default_ttl(), Duration::seconds(60));
        // a cap of zero would make every create evict itself
        assert_eq!(config.max_sessions_per_user(), 1);
        assert_eq!(config.reap_interval(), std::time::Duration::from_secs(10));
    }

    #[test]
    fn recency_falls_back_to_created_at() {
        let now = Utc::now();
        let mut session = Session {
            id: "id".to_string(),
            user_id: Uuid::new_v4(),
            created_at: now,
            expires_at: now + Duration::seconds(10),
            last_used_at: None,
            request_count: 0,
            metadata: BTreeMap::new(),
        };
        assert_eq!(session.recency(), now);
        assert!(session.is_live(now));
        assert!(!session.is_live(now + Duration::seconds(10)));
        assert_eq!(
            session.remaining(now + Duration::seconds(20)),
            Duration::zero()
        );

        session.last_used_at = Some(now + Duration::seconds(3));
        assert_eq!(session.recency(), now + Duration::seconds(3));
    }

    #[test]
    fn expired_counts_as_not_found() {
        assert!(SessionError::Expired.is_not_found());
        assert!(SessionError::NotFound.is_not_found());
        assert!(!SessionError::InvalidTtl.is_not_found());
    }
}

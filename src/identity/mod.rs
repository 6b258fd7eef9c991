//! Caller identity and the external capabilities it is resolved from.
//!
//! The gateway never owns credentials or user records. Bearer tokens are
//! verified by an [`AuthProvider`]; roles and account status come from a
//! [`ProfileStore`]. Both are traits so the request pipeline can run against
//! the in-memory doubles in [`memory`].

pub mod memory;
mod postgres;
mod provider;

pub use memory::{MemoryProfileStore, StaticAuthProvider};
pub use postgres::PgProfileStore;
pub use provider::HttpAuthProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
    Viewer,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
            Self::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            "viewer" => Ok(Self::Viewer),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Active,
    Suspended,
}

impl AccountStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown account status: {other}")),
        }
    }
}

/// Durable user record owned by the profile store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Profile {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How the caller proved who they are.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthSource {
    Session {
        session_id: String,
        expires_at: DateTime<Utc>,
    },
    Bearer,
}

/// Verified caller, attached to the request by the auth guards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
    pub status: AccountStatus,
    pub source: AuthSource,
}

impl Identity {
    #[must_use]
    pub fn from_profile(profile: Profile, source: AuthSource) -> Self {
        Self {
            user_id: profile.user_id,
            email: profile.email,
            role: profile.role,
            status: profile.status,
            source,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match &self.source {
            AuthSource::Session { session_id, .. } => Some(session_id),
            AuthSource::Bearer => None,
        }
    }
}

/// Result of a successful bearer token verification.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifiedToken {
    pub subject: Uuid,
    pub claims: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("token rejected by identity provider")]
    InvalidToken,
    #[error("identity not found")]
    NotFound,
    #[error("request rejected by identity provider: {0}")]
    Rejected(String),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("profile not found")]
    NotFound,
    #[error("profile already exists")]
    AlreadyExists,
    #[error("profile store error: {0}")]
    Backend(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfilePage {
    pub profiles: Vec<Profile>,
    pub has_more: bool,
}

/// Identity provider operations.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// # Errors
    /// `InvalidToken` when the provider rejects the token.
    async fn verify_token(&self, token: &str) -> Result<VerifiedToken, ProviderError>;

    async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &SecretString,
        new_password: &SecretString,
    ) -> Result<(), ProviderError>;

    async fn delete_identity(&self, user_id: Uuid) -> Result<(), ProviderError>;

    /// Returns the new identity's subject id. Used by signup flows outside the
    /// request path; the gateway itself only verifies tokens.
    async fn create_identity(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Uuid, ProviderError>;
}

/// CRUD over durable user profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_by_user_id(&self, user_id: Uuid) -> Result<Profile, ProfileError>;

    /// Profiles ordered by creation time; `has_more` reports whether another page exists.
    async fn list(&self, page: Pagination) -> Result<ProfilePage, ProfileError>;

    /// Used by provisioning outside the request path. `AlreadyExists` when the
    /// user id is taken.
    async fn create(&self, profile: Profile) -> Result<Profile, ProfileError>;

    /// Replace role, status, email and display name of an existing profile.
    async fn update(&self, profile: Profile) -> Result<Profile, ProfileError>;

    async fn delete(&self, user_id: Uuid) -> Result<(), ProfileError>;

    /// Reachability check used by `/health`.
    async fn ping(&self) -> Result<(), ProfileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_and_status_round_trip_as_text() {
        for role in [Role::Admin, Role::Member, Role::Viewer] {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
        for status in [
            AccountStatus::Pending,
            AccountStatus::Active,
            AccountStatus::Suspended,
        ] {
            assert_eq!(status.as_str().parse::<AccountStatus>(), Ok(status));
        }
        assert!("Admin".parse::<Role>().is_err());
    }

    #[test]
    fn role_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Role::Viewer).ok(),
            Some("\"viewer\"".to_string())
        );
    }

    #[test]
    fn session_id_only_for_session_source() {
        let now = Utc::now();
        let profile = Profile {
            user_id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            display_name: None,
            role: Role::Member,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let bearer = Identity::from_profile(profile.clone(), AuthSource::Bearer);
        assert_eq!(bearer.session_id(), None);

        let session = Identity::from_profile(
            profile,
            AuthSource::Session {
                session_id: "sid".to_string(),
                expires_at: now,
            },
        );
        assert_eq!(session.session_id(), Some("sid"));
    }
}

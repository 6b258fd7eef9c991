//! In-memory capability implementations for tests and local development.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AuthProvider, Pagination, Profile, ProfileError, ProfilePage, ProfileStore, ProviderError,
    VerifiedToken,
};

#[derive(Debug, Default)]
struct Identities {
    tokens: HashMap<String, Uuid>,
    passwords: HashMap<Uuid, Option<String>>,
    emails: HashMap<String, Uuid>,
}

/// Auth provider backed by a fixed token table.
#[derive(Debug, Default)]
pub struct StaticAuthProvider {
    identities: RwLock<Identities>,
}

impl StaticAuthProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user_id: Uuid) -> Self {
        let identities = self.identities.get_mut();
        identities.tokens.insert(token.into(), user_id);
        identities.passwords.entry(user_id).or_insert(None);
        self
    }

    #[must_use]
    pub fn with_password(mut self, user_id: Uuid, password: impl Into<String>) -> Self {
        self.identities
            .get_mut()
            .passwords
            .insert(user_id, Some(password.into()));
        self
    }

    pub async fn insert_token(&self, token: impl Into<String>, user_id: Uuid) {
        let mut identities = self.identities.write().await;
        identities.tokens.insert(token.into(), user_id);
        identities.passwords.entry(user_id).or_insert(None);
    }

    /// Whether the provider still knows `user_id`.
    pub async fn contains(&self, user_id: Uuid) -> bool {
        self.identities.read().await.passwords.contains_key(&user_id)
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn verify_token(&self, token: &str) -> Result<VerifiedToken, ProviderError> {
        let identities = self.identities.read().await;
        let subject = identities
            .tokens
            .get(token)
            .copied()
            .ok_or(ProviderError::InvalidToken)?;
        let mut claims = serde_json::Map::new();
        claims.insert("sub".to_string(), subject.to_string().into());
        Ok(VerifiedToken { subject, claims })
    }

    async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &SecretString,
        new_password: &SecretString,
    ) -> Result<(), ProviderError> {
        let mut identities = self.identities.write().await;
        let stored = identities
            .passwords
            .get_mut(&user_id)
            .ok_or(ProviderError::NotFound)?;
        match stored {
            Some(password) if password.as_str() == current_password.expose_secret() => {
                *password = new_password.expose_secret().to_string();
                Ok(())
            }
            _ => Err(ProviderError::Rejected(
                "current password is incorrect".to_string(),
            )),
        }
    }

    async fn delete_identity(&self, user_id: Uuid) -> Result<(), ProviderError> {
        let mut identities = self.identities.write().await;
        if identities.passwords.remove(&user_id).is_none() {
            return Err(ProviderError::NotFound);
        }
        identities.tokens.retain(|_, subject| *subject != user_id);
        identities.emails.retain(|_, subject| *subject != user_id);
        Ok(())
    }

    async fn create_identity(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Uuid, ProviderError> {
        let mut identities = self.identities.write().await;
        let email = email.trim().to_lowercase();
        if identities.emails.contains_key(&email) {
            return Err(ProviderError::Rejected(
                "identity already exists".to_string(),
            ));
        }
        let user_id = Uuid::new_v4();
        identities.emails.insert(email, user_id);
        identities
            .passwords
            .insert(user_id, Some(password.expose_secret().to_string()));
        Ok(user_id)
    }
}

/// Profile store kept in a map; can be toggled unreachable to exercise health checks.
#[derive(Debug)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<Uuid, Profile>>,
    available: AtomicBool,
}

impl MemoryProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profiles.get_mut().insert(profile.user_id, profile);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ProfileError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProfileError::Backend("profile store unreachable".to_string()))
        }
    }
}

impl Default for MemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_by_user_id(&self, user_id: Uuid) -> Result<Profile, ProfileError> {
        self.check_available()?;
        self.profiles
            .read()
            .await
            .get(&user_id)
            .cloned()
            .ok_or(ProfileError::NotFound)
    }

    async fn list(&self, page: Pagination) -> Result<ProfilePage, ProfileError> {
        self.check_available()?;
        let profiles = self.profiles.read().await;
        let mut all: Vec<&Profile> = profiles.values().collect();
        all.sort_by_key(|profile| (profile.created_at, profile.user_id));

        let offset = page.offset as usize;
        let limit = page.limit as usize;
        let profiles: Vec<Profile> = all
            .iter()
            .skip(offset)
            .take(limit)
            .map(|profile| (*profile).clone())
            .collect();
        let has_more = all.len() > offset.saturating_add(limit);
        Ok(ProfilePage { profiles, has_more })
    }

    async fn create(&self, profile: Profile) -> Result<Profile, ProfileError> {
        self.check_available()?;
        let mut profiles = self.profiles.write().await;
        if profiles.contains_key(&profile.user_id) {
            return Err(ProfileError::AlreadyExists);
        }
        profiles.insert(profile.user_id, profile.clone());
        Ok(profile)
    }

    async fn update(&self, profile: Profile) -> Result<Profile, ProfileError> {
        self.check_available()?;
        let mut profiles = self.profiles.write().await;
        let existing = profiles
            .get_mut(&profile.user_id)
            .ok_or(ProfileError::NotFound)?;
        *existing = Profile {
            created_at: existing.created_at,
            ..profile
        };
        Ok(existing.clone())
    }

    async fn delete(&self, user_id: Uuid) -> Result<(), ProfileError> {
        self.check_available()?;
        self.profiles
            .write()
            .await
            .remove(&user_id)
            .map(|_| ())
            .ok_or(ProfileError::NotFound)
    }

    async fn ping(&self) -> Result<(), ProfileError> {
        self.check_available()
    }
}

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Duration;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tokio::{sync::RwLock, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{Session, SessionConfig, SessionError};
use crate::clock::Clock;

/// 32 bytes of entropy, base64url without padding (43 chars).
const SESSION_TOKEN_BYTES: usize = 32;

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    by_user: HashMap<Uuid, HashSet<String>>,
}

impl Inner {
    fn insert(&mut self, session: Session) {
        self.by_user
            .entry(session.user_id)
            .or_default()
            .insert(session.id.clone());
        self.sessions.insert(session.id.clone(), session);
    }

    // the per-user index entry disappears with the user's last session
    fn remove(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if let Some(ids) = self.by_user.get_mut(&session.user_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_user.remove(&session.user_id);
            }
        }
        Some(session)
    }

    fn user_session_ids(&self, user_id: Uuid) -> Vec<String> {
        self.by_user
            .get(&user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct SessionStats {
    pub sessions: usize,
    pub users: usize,
}

/// In-memory session store guarded by a single lock.
///
/// Mutations (create, validate, extend, revoke, reap) take the write lock;
/// listing and stats take the read lock.
pub struct SessionStore {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl SessionStore {
    #[must_use]
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: RwLock::new(Inner::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current time according to the store's clock.
    #[must_use]
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Create a session for `user_id`, evicting the user's least recently used
    /// session first when the per-user cap is reached.
    ///
    /// # Errors
    /// Returns `InvalidTtl` for a non-positive TTL and `Entropy` if the OS RNG fails.
    pub async fn create(
        &self,
        user_id: Uuid,
        ttl: Duration,
        metadata: BTreeMap<String, String>,
    ) -> Result<Session, SessionError> {
        if ttl <= Duration::zero() {
            return Err(SessionError::InvalidTtl);
        }

        let mut inner = self.inner.write().await;
        let now = self.clock.now();

        // Expired sessions of this user never count against the cap.
        let mut live = Vec::new();
        for id in inner.user_session_ids(user_id) {
            match inner.sessions.get(&id) {
                Some(session) if session.is_live(now) => live.push((session.recency(), id)),
                _ => {
                    inner.remove(&id);
                }
            }
        }

        live.sort();
        let max = self.config.max_sessions_per_user();
        let mut live = live.into_iter();
        let mut remaining = live.len();
        while remaining >= max {
            let Some((_, oldest)) = live.next() else {
                break;
            };
            inner.remove(&oldest);
            remaining -= 1;
            debug!(user_id = %user_id, "evicted least recently used session");
        }

        let mut id = generate_session_token()?;
        while inner.sessions.contains_key(&id) {
            id = generate_session_token()?;
        }

        let session = Session {
            id,
            user_id,
            created_at: now,
            expires_at: now + ttl,
            last_used_at: None,
            request_count: 0,
            metadata,
        };
        inner.insert(session.clone());

        Ok(session)
    }

    /// Look up a live session and record its use.
    ///
    /// Touches `last_used_at`, increments `request_count` and, when less than
    /// half of the default TTL remains, extends the session to a full default TTL.
    ///
    /// # Errors
    /// `NotFound` for unknown ids, `Expired` for sessions past `expires_at`
    /// (which are deleted on the spot).
    pub async fn validate(&self, id: &str) -> Result<Session, SessionError> {
        let mut inner = self.inner.write().await;
        let now = self.clock.now();

        let Some(session) = inner.sessions.get_mut(id) else {
            return Err(SessionError::NotFound);
        };

        if !session.is_live(now) {
            inner.remove(id);
            return Err(SessionError::Expired);
        }

        session.last_used_at = Some(now);
        session.request_count = session.request_count.saturating_add(1);

        let default_ttl = self.config.default_ttl();
        if session.remaining(now) < default_ttl / 2 {
            session.expires_at = now + default_ttl;
            debug!(user_id = %session.user_id, "session auto-extended");
        }

        Ok(session.clone())
    }

    /// Reset `expires_at` to `now + ttl`. Extension is absolute, not additive.
    ///
    /// # Errors
    /// `InvalidTtl`, or `NotFound`/`Expired` like [`Self::validate`].
    pub async fn extend(&self, id: &str, ttl: Duration) -> Result<Session, SessionError> {
        if ttl <= Duration::zero() {
            return Err(SessionError::InvalidTtl);
        }

        let mut inner = self.inner.write().await;
        let now = self.clock.now();

        let Some(session) = inner.sessions.get_mut(id) else {
            return Err(SessionError::NotFound);
        };

        if !session.is_live(now) {
            inner.remove(id);
            return Err(SessionError::Expired);
        }

        session.expires_at = now + ttl;
        Ok(session.clone())
    }

    /// # Errors
    /// `NotFound` when the id is unknown; callers usually ignore it.
    pub async fn revoke(&self, id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        inner.remove(id).map(|_| ()).ok_or(SessionError::NotFound)
    }

    /// Revoke `id` only if it belongs to `user_id`.
    ///
    /// # Errors
    /// `NotFound` when the id is unknown or owned by another user.
    pub async fn revoke_for_user(&self, user_id: Uuid, id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get(id) {
            Some(session) if session.user_id == user_id => {
                inner.remove(id);
                Ok(())
            }
            _ => Err(SessionError::NotFound),
        }
    }

    /// Returns how many sessions were removed.
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> usize {
        let mut inner = self.inner.write().await;
        let ids = inner.user_session_ids(user_id);
        let mut removed = 0;
        for id in ids {
            if inner.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Revoke every session of `user_id` except `keep`.
    pub async fn revoke_others_for_user(&self, user_id: Uuid, keep: &str) -> usize {
        let mut inner = self.inner.write().await;
        let ids = inner.user_session_ids(user_id);
        let mut removed = 0;
        for id in ids.iter().filter(|id| id.as_str() != keep) {
            if inner.remove(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Live sessions of `user_id`, oldest first.
    pub async fn list_for_user(&self, user_id: Uuid) -> Vec<Session> {
        let inner = self.inner.read().await;
        let now = self.clock.now();
        let mut sessions: Vec<Session> = inner
            .by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|session| session.is_live(now))
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.created_at);
        sessions
    }

    pub async fn stats(&self) -> SessionStats {
        let inner = self.inner.read().await;
        SessionStats {
            sessions: inner.sessions.len(),
            users: inner.by_user.len(),
        }
    }

    /// Delete every expired session. Returns how many were removed.
    pub async fn reap(&self) -> usize {
        let mut inner = self.inner.write().await;
        let now = self.clock.now();
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|session| !session.is_live(now))
            .map(|session| session.id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        expired.len()
    }

    /// Run [`Self::reap`] every `reap_interval` until `shutdown` is cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = store.config.reap_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        info!("session reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.reap().await;
                        if removed > 0 {
                            debug!(removed, "reaped expired sessions");
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn generate_session_token() -> Result<String, SessionError> {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| SessionError::Entropy(err.to_string()))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

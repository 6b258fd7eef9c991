use async_trait::async_trait;
use sqlx::{postgres::PgRow, Connection, PgPool, Row};
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

use super::{Pagination, Profile, ProfileError, ProfilePage, ProfileStore};

const PROFILE_COLUMNS: &str =
    "user_id, email, display_name, role, status, created_at, updated_at";

/// Profiles in the `profiles` table (see `db/sql/profiles.sql`).
#[derive(Clone, Debug)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> ProfileError {
    match err {
        sqlx::Error::RowNotFound => ProfileError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => ProfileError::AlreadyExists,
        other => {
            error!("profile store query failed: {other}");
            ProfileError::Backend(other.to_string())
        }
    }
}

fn profile_from_row(row: &PgRow) -> Result<Profile, ProfileError> {
    let role: String = row.try_get("role").map_err(backend)?;
    let status: String = row.try_get("status").map_err(backend)?;

    Ok(Profile {
        user_id: row.try_get("user_id").map_err(backend)?,
        email: row.try_get("email").map_err(backend)?,
        display_name: row.try_get("display_name").map_err(backend)?,
        role: role.parse().map_err(ProfileError::Backend)?,
        status: status.parse().map_err(ProfileError::Backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn get_by_user_id(&self, user_id: Uuid) -> Result<Profile, ProfileError> {
        let query = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = $1");
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(info_span!("db.query", db.system = "postgresql", db.operation = "SELECT"))
            .await
            .map_err(backend)?
            .ok_or(ProfileError::NotFound)?;
        profile_from_row(&row)
    }

    async fn list(&self, page: Pagination) -> Result<ProfilePage, ProfileError> {
        // one extra row tells us whether another page exists
        let query = format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY created_at, user_id LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query(&query)
            .bind(i64::from(page.limit) + 1)
            .bind(i64::from(page.offset))
            .fetch_all(&self.pool)
            .instrument(info_span!("db.query", db.system = "postgresql", db.operation = "SELECT"))
            .await
            .map_err(backend)?;

        let has_more = rows.len() > page.limit as usize;
        let profiles = rows
            .iter()
            .take(page.limit as usize)
            .map(profile_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProfilePage { profiles, has_more })
    }

    async fn create(&self, profile: Profile) -> Result<Profile, ProfileError> {
        let query = format!(
            r"
            INSERT INTO profiles (user_id, email, display_name, role, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {PROFILE_COLUMNS}
            "
        );
        let row = sqlx::query(&query)
            .bind(profile.user_id)
            .bind(&profile.email)
            .bind(&profile.display_name)
            .bind(profile.role.as_str())
            .bind(profile.status.as_str())
            .bind(profile.created_at)
            .bind(profile.updated_at)
            .fetch_one(&self.pool)
            .instrument(info_span!("db.query", db.system = "postgresql", db.operation = "INSERT"))
            .await
            .map_err(backend)?;
        profile_from_row(&row)
    }

    async fn update(&self, profile: Profile) -> Result<Profile, ProfileError> {
        let query = format!(
            r"
            UPDATE profiles
            SET email = $2, display_name = $3, role = $4, status = $5, updated_at = NOW()
            WHERE user_id = $1
            RETURNING {PROFILE_COLUMNS}
            "
        );
        let row = sqlx::query(&query)
            .bind(profile.user_id)
            .bind(&profile.email)
            .bind(&profile.display_name)
            .bind(profile.role.as_str())
            .bind(profile.status.as_str())
            .fetch_optional(&self.pool)
            .instrument(info_span!("db.query", db.system = "postgresql", db.operation = "UPDATE"))
            .await
            .map_err(backend)?
            .ok_or(ProfileError::NotFound)?;
        profile_from_row(&row)
    }

    async fn delete(&self, user_id: Uuid) -> Result<(), ProfileError> {
        let result = sqlx::query("DELETE FROM profiles WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .instrument(info_span!("db.query", db.system = "postgresql", db.operation = "DELETE"))
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(ProfileError::NotFound);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), ProfileError> {
        let acquire_span = info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .map_err(backend)?;
        let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        conn.ping().instrument(ping_span).await.map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn unreachable_database_is_a_backend_error() -> Result<(), sqlx::Error> {
        // lazy pools only fail once a connection is needed
        let pool = PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgres://portero@127.0.0.1:1/portero")?;
        let store = PgProfileStore::new(pool);
        assert!(matches!(store.ping().await, Err(ProfileError::Backend(_))));
        Ok(())
    }
}

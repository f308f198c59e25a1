//! SQLite repository.
//!
//! A single-connection pool: SQLite serialises writers anyway, and one
//! connection keeps `sqlite::memory:` databases alive for the pool's life.
//! Every mutation runs in a transaction; the UNIQUE constraints have the
//! last word on duplicates.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::{Repository, Result, StoreError};
use crate::migrate::migrate_sqlite;
use crate::models::auth::{NewUser, RefreshTokenRecord, User, UserWithPassword};
use crate::models::ban::BanTarget;

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    username: String,
    password_hash: String,
    token_generation: i64,
    banned: i64,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for UserWithPassword {
    fn from(row: UserRow) -> Self {
        UserWithPassword {
            user: User {
                id: row.id,
                username: row.username,
                token_generation: row.token_generation,
                banned: row.banned != 0,
                created_at: row.created_at,
            },
            password_hash: row.password_hash,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RefreshRow {
    id: String,
    user_id: String,
    token_hash: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

impl From<RefreshRow> for RefreshTokenRecord {
    fn from(row: RefreshRow) -> Self {
        RefreshTokenRecord {
            id: row.id,
            user_id: row.user_id,
            token_hash: row.token_hash,
            expires_at: row.expires_at,
            created_at: row.created_at,
            revoked_at: row.revoked_at,
        }
    }
}

/// Map a UNIQUE violation to `dup`, anything else to `Unavailable`.
fn unique_or(err: sqlx::Error, dup: StoreError) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => dup,
        _ => err.into(),
    }
}

/// Repository over a SQLite database file.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open (creating if needed) the database at `location` and migrate it.
    pub async fn open(location: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(location)
            .create_if_missing(true)
            .foreign_keys(true);
        Self::connect_with(options).await
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        migrate_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_ban(&self, table: BanTable, value: &str) -> Result<()> {
        let target = table.target();
        let mut tx = self.pool.begin().await?;

        let present: i64 = sqlx::query_scalar(table.exists_sql())
            .bind(value)
            .fetch_one(&mut *tx)
            .await?;
        if present > 0 {
            return Err(StoreError::AlreadyBanned(target));
        }

        sqlx::query(table.insert_sql())
            .bind(value)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| unique_or(e, StoreError::AlreadyBanned(target)))?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_ban(&self, table: BanTable, value: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(table.delete_sql())
            .bind(value)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn ban_exists(&self, table: BanTable, value: &str) -> Result<bool> {
        let present: i64 = sqlx::query_scalar(table.exists_sql())
            .bind(value)
            .fetch_one(&self.pool)
            .await?;
        Ok(present > 0)
    }
}

#[derive(Clone, Copy)]
enum BanTable {
    Ips,
    Hwids,
}

impl BanTable {
    fn target(self) -> BanTarget {
        match self {
            BanTable::Ips => BanTarget::Ip,
            BanTable::Hwids => BanTarget::Hwid,
        }
    }

    fn exists_sql(self) -> &'static str {
        match self {
            BanTable::Ips => "SELECT COUNT(*) FROM blocked_ips WHERE ip = ?",
            BanTable::Hwids => "SELECT COUNT(*) FROM blocked_hwids WHERE hwid = ?",
        }
    }

    fn insert_sql(self) -> &'static str {
        match self {
            BanTable::Ips => "INSERT INTO blocked_ips (ip, created_at) VALUES (?, ?)",
            BanTable::Hwids => "INSERT INTO blocked_hwids (hwid, created_at) VALUES (?, ?)",
        }
    }

    fn delete_sql(self) -> &'static str {
        match self {
            BanTable::Ips => "DELETE FROM blocked_ips WHERE ip = ?",
            BanTable::Hwids => "DELETE FROM blocked_hwids WHERE hwid = ?",
        }
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn insert_user(&self, user: &NewUser) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE username = ?")
            .bind(&user.username)
            .fetch_one(&mut *tx)
            .await?;
        if taken > 0 {
            return Err(StoreError::UsernameTaken(user.username.clone()));
        }

        sqlx::query(
            "INSERT INTO users (id, username, password_hash, token_generation, banned, created_at) \
             VALUES (?, ?, ?, 0, 0, ?)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_or(e, StoreError::UsernameTaken(user.username.clone())))?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, token_generation, banned, created_at \
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| UserWithPassword::from(r).user))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserWithPassword>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, token_generation, banned, created_at \
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserWithPassword::from))
    }

    async fn ban_user(&self, user_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let banned: Option<i64> = sqlx::query_scalar("SELECT banned FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        match banned {
            None => return Err(StoreError::UserNotFound(user_id.to_string())),
            Some(b) if b != 0 => return Err(StoreError::AlreadyBanned(BanTarget::User)),
            Some(_) => {}
        }

        let updated = sqlx::query("UPDATE users SET banned = 1 WHERE id = ? AND banned = 0")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::AlreadyBanned(BanTarget::User));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn unban_user(&self, user_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE users SET banned = 0 WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM refresh_tokens WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn bump_token_generation(&self, user_id: &str) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let generation: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET token_generation = token_generation + 1 \
             WHERE id = ? RETURNING token_generation",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let generation = generation.ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        tx.commit().await?;
        Ok(generation)
    }

    async fn is_ip_banned(&self, ip: &str) -> Result<bool> {
        self.ban_exists(BanTable::Ips, ip).await
    }

    async fn ban_ip(&self, ip: &str) -> Result<()> {
        self.insert_ban(BanTable::Ips, ip).await
    }

    async fn unban_ip(&self, ip: &str) -> Result<()> {
        self.delete_ban(BanTable::Ips, ip).await
    }

    async fn is_hwid_banned(&self, hwid: &str) -> Result<bool> {
        self.ban_exists(BanTable::Hwids, hwid).await
    }

    async fn ban_hwid(&self, hwid: &str) -> Result<()> {
        self.insert_ban(BanTable::Hwids, hwid).await
    }

    async fn unban_hwid(&self, hwid: &str) -> Result<()> {
        self.delete_ban(BanTable::Hwids, hwid).await
    }

    async fn store_refresh_token(&self, record: &RefreshTokenRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at, revoked_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.token_hash)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.revoked_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_refresh_token(&self, token_id: &str) -> Result<Option<RefreshTokenRecord>> {
        let row = sqlx::query_as::<_, RefreshRow>(
            "SELECT id, user_id, token_hash, expires_at, created_at, revoked_at \
             FROM refresh_tokens WHERE id = ?",
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RefreshTokenRecord::from))
    }

    async fn revoke_refresh_token(&self, token_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(token_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn revoke_all_refresh_tokens(&self, user_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated.rows_affected())
    }

    async fn purge_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(purged.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

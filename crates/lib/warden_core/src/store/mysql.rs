//! MySQL repository.
//!
//! Same contract as the SQLite backend over a pooled server connection.
//! Usernames compare byte-wise (`utf8mb4_bin`), and ban checks lock the
//! row they read with `FOR UPDATE` so concurrent bans see each other.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use tracing::debug;

use super::{Repository, Result, StoreError};
use crate::config::MysqlConfig;
use crate::migrate::migrate_mysql;
use crate::models::auth::{NewUser, RefreshTokenRecord, User, UserWithPassword};
use crate::models::ban::BanTarget;

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    username: String,
    password_hash: String,
    token_generation: i64,
    banned: bool,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for UserWithPassword {
    fn from(row: UserRow) -> Self {
        UserWithPassword {
            user: User {
                id: row.id,
                username: row.username,
                token_generation: row.token_generation,
                banned: row.banned,
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

fn unique_or(err: sqlx::Error, dup: StoreError) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => dup,
        _ => err.into(),
    }
}

/// Repository over a MySQL (or MariaDB) database.
#[derive(Clone)]
pub struct MysqlRepository {
    pool: MySqlPool,
}

impl MysqlRepository {
    /// Connect with the pool limits from `config` and migrate the schema.
    pub async fn connect(config: &MysqlConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .connect(&config.url)
            .await?;
        migrate_mysql(&pool).await?;
        debug!(max_connections = config.max_connections, "mysql pool ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn insert_ban(&self, table: BanTable, value: &str) -> Result<()> {
        let target = table.target();
        sqlx::query(table.insert_sql())
            .bind(value)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| unique_or(e, StoreError::AlreadyBanned(target)))?;
        Ok(())
    }

    async fn delete_ban(&self, table: BanTable, value: &str) -> Result<()> {
        sqlx::query(table.delete_sql())
            .bind(value)
            .execute(&self.pool)
            .await?;
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
impl Repository for MysqlRepository {
    async fn insert_user(&self, user: &NewUser) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, token_generation, banned, created_at) \
             VALUES (?, ?, ?, 0, FALSE, ?)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or(e, StoreError::UsernameTaken(user.username.clone())))?;
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

        let banned: Option<bool> =
            sqlx::query_scalar("SELECT banned FROM users WHERE id = ? FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        match banned {
            None => return Err(StoreError::UserNotFound(user_id.to_string())),
            Some(true) => return Err(StoreError::AlreadyBanned(BanTarget::User)),
            Some(false) => {}
        }

        sqlx::query("UPDATE users SET banned = TRUE WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn unban_user(&self, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET banned = FALSE WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
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
        // No RETURNING in MySQL: the row lock from the UPDATE holds until
        // commit, so the SELECT reads our own increment.
        let mut tx = self.pool.begin().await?;
        let updated =
            sqlx::query("UPDATE users SET token_generation = token_generation + 1 WHERE id = ?")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }
        let generation: i64 = sqlx::query_scalar("SELECT token_generation FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
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
        .execute(&self.pool)
        .await?;
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
        let updated = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn revoke_all_refresh_tokens(&self, user_id: &str) -> Result<u64> {
        let updated = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
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

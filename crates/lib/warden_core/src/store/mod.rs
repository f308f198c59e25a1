//! Credential and ban-list storage.
//!
//! [`Repository`] is the backend contract: every method is one atomic unit
//! against the underlying engine and works on password *hashes*.
//! [`CredentialStore`] is what the rest of the system talks to. It hashes
//! passwords, normalises IPs and bounds every call with a deadline.

pub mod memory;
pub mod mysql;
pub mod redis;
pub mod sqlite;
pub mod sweep;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::password;
use crate::config::{Backend, StorageConfig};
use crate::models::auth::{NewUser, RefreshTokenRecord, User, UserWithPassword};
use crate::models::ban::{BanTarget, normalize_ip};
use crate::uuid::new_id;

pub use self::memory::MemoryRepository;
pub use self::mysql::MysqlRepository;
pub use self::redis::RedisRepository;
pub use self::sqlite::SqliteRepository;

/// Credential store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Username already exists: {0}")]
    UsernameTaken(String),

    #[error("{0} is already banned")]
    AlreadyBanned(BanTarget),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Password hashing failed: {0}")]
    Hashing(#[from] bcrypt::BcryptError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unavailable(format!("migration failed: {e}"))
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage backend contract.
///
/// Each mutating method is atomic on its own. Uniqueness is enforced by the
/// engine, and a racing duplicate insert must surface as `UsernameTaken` or
/// `AlreadyBanned` rather than leave partial state behind.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert a user. Fails with `UsernameTaken` on an exact username match.
    async fn insert_user(&self, user: &NewUser) -> Result<()>;

    async fn find_user(&self, user_id: &str) -> Result<Option<User>>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserWithPassword>>;

    /// Set the banned flag. `AlreadyBanned` if set, `UserNotFound` if absent.
    async fn ban_user(&self, user_id: &str) -> Result<()>;

    /// Clear the banned flag. No-op when not banned or absent.
    async fn unban_user(&self, user_id: &str) -> Result<()>;

    /// Remove a user with its refresh records. Returns whether it existed.
    async fn delete_user(&self, user_id: &str) -> Result<bool>;

    /// Increment the token generation and return the new value.
    async fn bump_token_generation(&self, user_id: &str) -> Result<i64>;

    async fn is_ip_banned(&self, ip: &str) -> Result<bool>;

    /// `AlreadyBanned` if present.
    async fn ban_ip(&self, ip: &str) -> Result<()>;

    /// No-op when absent.
    async fn unban_ip(&self, ip: &str) -> Result<()>;

    async fn is_hwid_banned(&self, hwid: &str) -> Result<bool>;

    async fn ban_hwid(&self, hwid: &str) -> Result<()>;

    async fn unban_hwid(&self, hwid: &str) -> Result<()>;

    async fn store_refresh_token(&self, record: &RefreshTokenRecord) -> Result<()>;

    async fn find_refresh_token(&self, token_id: &str) -> Result<Option<RefreshTokenRecord>>;

    /// Mark a record revoked. Returns whether a live record was revoked.
    async fn revoke_refresh_token(&self, token_id: &str) -> Result<bool>;

    /// Revoke every live record of a user. Returns how many were revoked.
    async fn revoke_all_refresh_tokens(&self, user_id: &str) -> Result<u64>;

    /// Delete refresh records that expired at or before `now`. Returns how
    /// many entries were removed.
    async fn purge_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<()>;
}

/// Open the backend selected in `config`.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Repository>> {
    let backend = config
        .backend()
        .map_err(|e| StoreError::Invalid(e.to_string()))?;
    let repo: Arc<dyn Repository> = match backend {
        Backend::Sqlite => {
            Arc::new(SqliteRepository::open(&config.sqlite.database_location).await?)
        }
        Backend::Mysql => Arc::new(MysqlRepository::connect(&config.mysql).await?),
        Backend::Redis => Arc::new(
            RedisRepository::connect(&config.redis.url, &config.redis.key_prefix).await?,
        ),
        Backend::Embedded => Arc::new(MemoryRepository::new()),
    };
    info!(backend = ?backend, "credential store ready");
    Ok(repo)
}

/// Run `fut` with a deadline. An elapsed deadline is `Unavailable`.
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "operation timed out after {timeout:?}"
        ))),
    }
}

/// The credential store used by the token service, the gate and the CLI.
#[derive(Clone)]
pub struct CredentialStore {
    repo: Arc<dyn Repository>,
    timeout: Duration,
}

impl CredentialStore {
    pub fn new(repo: Arc<dyn Repository>, timeout: Duration) -> Self {
        Self { repo, timeout }
    }

    /// Same store with a different per-call deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            repo: self.repo.clone(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a user and return its id.
    pub async fn create_user(&self, username: &str, password: &str) -> Result<String> {
        if username.trim().is_empty() {
            return Err(StoreError::Invalid("username must not be empty".into()));
        }
        if password.is_empty() {
            return Err(StoreError::Invalid("password must not be empty".into()));
        }

        let password_hash = password::hash_password(password)?;
        let user = NewUser {
            id: new_id(),
            username: username.to_string(),
            password_hash,
            created_at: Utc::now(),
        };
        bounded(self.timeout, self.repo.insert_user(&user)).await?;
        info!(user_id = %user.id, username, "user created");
        Ok(user.id)
    }

    /// Check a password. Unknown usernames verify as `false`.
    pub async fn verify_password(&self, username: &str, password: &str) -> Result<bool> {
        Ok(self.authenticate(username, password).await?.is_some())
    }

    /// Return the user when the password matches.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let Some(found) =
            bounded(self.timeout, self.repo.find_user_by_username(username)).await?
        else {
            debug!(username, "authentication for unknown user");
            return Ok(None);
        };
        if password::verify_password(password, &found.password_hash)? {
            Ok(Some(found.user))
        } else {
            Ok(None)
        }
    }

    pub async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        bounded(self.timeout, self.repo.find_user(user_id)).await
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let found = bounded(self.timeout, self.repo.find_user_by_username(username)).await?;
        Ok(found.map(|f| f.user))
    }

    /// Whether the user is banned. Unknown users are not banned.
    pub async fn is_user_banned(&self, user_id: &str) -> Result<bool> {
        Ok(self.find_user(user_id).await?.is_some_and(|u| u.banned))
    }

    pub async fn ban_user(&self, user_id: &str) -> Result<()> {
        bounded(self.timeout, self.repo.ban_user(user_id)).await?;
        info!(user_id, "user banned");
        Ok(())
    }

    pub async fn unban_user(&self, user_id: &str) -> Result<()> {
        bounded(self.timeout, self.repo.unban_user(user_id)).await?;
        info!(user_id, "user unbanned");
        Ok(())
    }

    /// Delete a user and every refresh record it owns.
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        if !bounded(self.timeout, self.repo.delete_user(user_id)).await? {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }
        info!(user_id, "user deleted");
        Ok(())
    }

    pub async fn bump_token_generation(&self, user_id: &str) -> Result<i64> {
        bounded(self.timeout, self.repo.bump_token_generation(user_id)).await
    }

    pub async fn is_ip_banned(&self, ip: &str) -> Result<bool> {
        let ip = normalize_ip(ip);
        bounded(self.timeout, self.repo.is_ip_banned(&ip)).await
    }

    pub async fn ban_ip(&self, ip: &str) -> Result<()> {
        let ip = normalize_ip(ip);
        if ip.is_empty() {
            return Err(StoreError::Invalid("IP must not be empty".into()));
        }
        bounded(self.timeout, self.repo.ban_ip(&ip)).await?;
        info!(ip = %ip, "IP banned");
        Ok(())
    }

    pub async fn unban_ip(&self, ip: &str) -> Result<()> {
        let ip = normalize_ip(ip);
        bounded(self.timeout, self.repo.unban_ip(&ip)).await?;
        info!(ip = %ip, "IP unbanned");
        Ok(())
    }

    pub async fn is_hwid_banned(&self, hwid: &str) -> Result<bool> {
        bounded(self.timeout, self.repo.is_hwid_banned(hwid)).await
    }

    pub async fn ban_hwid(&self, hwid: &str) -> Result<()> {
        if hwid.is_empty() {
            return Err(StoreError::Invalid("HWID must not be empty".into()));
        }
        bounded(self.timeout, self.repo.ban_hwid(hwid)).await?;
        info!(hwid, "HWID banned");
        Ok(())
    }

    pub async fn unban_hwid(&self, hwid: &str) -> Result<()> {
        bounded(self.timeout, self.repo.unban_hwid(hwid)).await?;
        info!(hwid, "HWID unbanned");
        Ok(())
    }

    pub async fn store_refresh_token(&self, record: &RefreshTokenRecord) -> Result<()> {
        bounded(self.timeout, self.repo.store_refresh_token(record)).await
    }

    pub async fn find_refresh_token(&self, token_id: &str) -> Result<Option<RefreshTokenRecord>> {
        bounded(self.timeout, self.repo.find_refresh_token(token_id)).await
    }

    pub async fn revoke_refresh_token(&self, token_id: &str) -> Result<bool> {
        bounded(self.timeout, self.repo.revoke_refresh_token(token_id)).await
    }

    pub async fn revoke_all_refresh_tokens(&self, user_id: &str) -> Result<u64> {
        bounded(self.timeout, self.repo.revoke_all_refresh_tokens(user_id)).await
    }

    /// Drop refresh records that are past their expiry.
    pub async fn purge_expired_refresh_tokens(&self) -> Result<u64> {
        let purged = bounded(
            self.timeout,
            self.repo.purge_expired_refresh_tokens(Utc::now()),
        )
        .await?;
        if purged > 0 {
            debug!(purged, "expired refresh records removed");
        }
        Ok(purged)
    }

    pub async fn ping(&self) -> Result<()> {
        bounded(self.timeout, self.repo.ping()).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Stalled;
    use super::*;

    fn memory_store() -> CredentialStore {
        CredentialStore::new(Arc::new(MemoryRepository::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn verify_password_scenario() {
        let store = memory_store();
        store.create_user("alice", "pw123").await.unwrap();
        assert!(store.verify_password("alice", "pw123").await.unwrap());
        assert!(!store.verify_password("alice", "wrong").await.unwrap());
        assert!(!store.verify_password("bob", "pw123").await.unwrap());
    }

    #[tokio::test]
    async fn password_is_not_stored_raw() {
        let repo = Arc::new(MemoryRepository::new());
        let store = CredentialStore::new(repo.clone(), Duration::from_secs(5));
        store.create_user("alice", "pw123").await.unwrap();
        let found = repo.find_user_by_username("alice").await.unwrap().unwrap();
        assert_ne!(found.password_hash, "pw123");
        assert!(found.password_hash.starts_with("$2"));
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let store = memory_store();
        store.create_user("alice", "pw123").await.unwrap();
        assert!(matches!(
            store.create_user("alice", "other").await,
            Err(StoreError::UsernameTaken(_))
        ));
        // exact match only
        store.create_user("Alice", "pw123").await.unwrap();
    }

    #[tokio::test]
    async fn empty_credentials_are_rejected() {
        let store = memory_store();
        assert!(matches!(
            store.create_user("", "pw").await,
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            store.create_user("carol", "").await,
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn ban_ip_twice_is_already_banned() {
        let store = memory_store();
        store.ban_ip("10.0.0.1").await.unwrap();
        assert!(matches!(
            store.ban_ip("10.0.0.1").await,
            Err(StoreError::AlreadyBanned(BanTarget::Ip))
        ));
    }

    #[tokio::test]
    async fn unban_ip_is_idempotent() {
        let store = memory_store();
        store.unban_ip("10.0.0.2").await.unwrap();
        store.ban_ip("10.0.0.2").await.unwrap();
        store.unban_ip("10.0.0.2").await.unwrap();
        store.unban_ip("10.0.0.2").await.unwrap();
        assert!(!store.is_ip_banned("10.0.0.2").await.unwrap());
    }

    #[tokio::test]
    async fn ip_checks_are_case_insensitive() {
        let store = memory_store();
        store.ban_ip("2001:DB8::1").await.unwrap();
        assert!(store.is_ip_banned("2001:db8::1").await.unwrap());
        assert!(matches!(
            store.ban_ip("2001:db8:0::1").await,
            Err(StoreError::AlreadyBanned(_))
        ));
    }

    #[tokio::test]
    async fn hwid_ban_lifecycle() {
        let store = memory_store();
        assert!(!store.is_hwid_banned("HW-1").await.unwrap());
        store.ban_hwid("HW-1").await.unwrap();
        assert!(store.is_hwid_banned("HW-1").await.unwrap());
        assert!(matches!(
            store.ban_hwid("HW-1").await,
            Err(StoreError::AlreadyBanned(BanTarget::Hwid))
        ));
        store.unban_hwid("HW-1").await.unwrap();
        store.unban_hwid("HW-1").await.unwrap();
        assert!(!store.is_hwid_banned("HW-1").await.unwrap());
    }

    #[tokio::test]
    async fn user_ban_lifecycle() {
        let store = memory_store();
        let id = store.create_user("u2", "pw").await.unwrap();
        assert!(!store.is_user_banned(&id).await.unwrap());
        store.ban_user(&id).await.unwrap();
        assert!(store.is_user_banned(&id).await.unwrap());
        assert!(matches!(
            store.ban_user(&id).await,
            Err(StoreError::AlreadyBanned(BanTarget::User))
        ));
        store.unban_user(&id).await.unwrap();
        store.unban_user(&id).await.unwrap();
        assert!(!store.is_user_banned(&id).await.unwrap());
    }

    #[tokio::test]
    async fn banning_unknown_user_fails() {
        let store = memory_store();
        assert!(matches!(
            store.ban_user("nobody").await,
            Err(StoreError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_user_removes_login_and_sessions() {
        let store = memory_store();
        let id = store.create_user("gone", "pw").await.unwrap();
        store.delete_user(&id).await.unwrap();
        assert!(!store.verify_password("gone", "pw").await.unwrap());
        assert!(matches!(
            store.delete_user(&id).await,
            Err(StoreError::UserNotFound(_))
        ));
        store.create_user("gone", "pw2").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_times_out_as_unavailable() {
        let store = CredentialStore::new(Arc::new(Stalled), Duration::from_millis(50));
        assert!(matches!(
            store.is_ip_banned("10.0.0.1").await,
            Err(StoreError::Unavailable(_))
        ));
        let quick = store.with_timeout(Duration::from_millis(1));
        assert!(matches!(
            quick.ban_hwid("hw").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}

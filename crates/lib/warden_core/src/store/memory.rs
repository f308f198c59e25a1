//! In-process repository.
//!
//! Backs the `embedded` storage option and the unit tests. Ban sets are
//! `DashSet`s, whose `insert` reports presence atomically. Users sit behind
//! one lock so the id and username indexes always change together.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;

use super::{Repository, Result, StoreError};
use crate::models::auth::{NewUser, RefreshTokenRecord, User, UserWithPassword};
use crate::models::ban::BanTarget;

#[derive(Default)]
struct Users {
    by_id: HashMap<String, UserWithPassword>,
    /// username -> id
    by_name: HashMap<String, String>,
}

/// Repository held entirely in memory.
#[derive(Default)]
pub struct MemoryRepository {
    users: RwLock<Users>,
    banned_ips: DashSet<String>,
    banned_hwids: DashSet<String>,
    refresh_tokens: DashMap<String, RefreshTokenRecord>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_user(&self, user: &NewUser) -> Result<()> {
        let mut users = self.users.write().await;
        if users.by_name.contains_key(&user.username) {
            return Err(StoreError::UsernameTaken(user.username.clone()));
        }
        users.by_name.insert(user.username.clone(), user.id.clone());
        users.by_id.insert(
            user.id.clone(),
            UserWithPassword {
                user: User {
                    id: user.id.clone(),
                    username: user.username.clone(),
                    token_generation: 0,
                    banned: false,
                    created_at: user.created_at,
                },
                password_hash: user.password_hash.clone(),
            },
        );
        Ok(())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.by_id.get(user_id).map(|u| u.user.clone()))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserWithPassword>> {
        let users = self.users.read().await;
        Ok(users
            .by_name
            .get(username)
            .and_then(|id| users.by_id.get(id))
            .cloned())
    }

    async fn ban_user(&self, user_id: &str) -> Result<()> {
        let mut users = self.users.write().await;
        let entry = users
            .by_id
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        if entry.user.banned {
            return Err(StoreError::AlreadyBanned(BanTarget::User));
        }
        entry.user.banned = true;
        Ok(())
    }

    async fn unban_user(&self, user_id: &str) -> Result<()> {
        let mut users = self.users.write().await;
        if let Some(entry) = users.by_id.get_mut(user_id) {
            entry.user.banned = false;
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool> {
        let mut users = self.users.write().await;
        let Some(removed) = users.by_id.remove(user_id) else {
            return Ok(false);
        };
        users.by_name.remove(&removed.user.username);
        self.refresh_tokens.retain(|_, record| record.user_id != user_id);
        Ok(true)
    }

    async fn bump_token_generation(&self, user_id: &str) -> Result<i64> {
        let mut users = self.users.write().await;
        let entry = users
            .by_id
            .get_mut(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        entry.user.token_generation += 1;
        Ok(entry.user.token_generation)
    }

    async fn is_ip_banned(&self, ip: &str) -> Result<bool> {
        Ok(self.banned_ips.contains(ip))
    }

    async fn ban_ip(&self, ip: &str) -> Result<()> {
        if self.banned_ips.insert(ip.to_string()) {
            Ok(())
        } else {
            Err(StoreError::AlreadyBanned(BanTarget::Ip))
        }
    }

    async fn unban_ip(&self, ip: &str) -> Result<()> {
        self.banned_ips.remove(ip);
        Ok(())
    }

    async fn is_hwid_banned(&self, hwid: &str) -> Result<bool> {
        Ok(self.banned_hwids.contains(hwid))
    }

    async fn ban_hwid(&self, hwid: &str) -> Result<()> {
        if self.banned_hwids.insert(hwid.to_string()) {
            Ok(())
        } else {
            Err(StoreError::AlreadyBanned(BanTarget::Hwid))
        }
    }

    async fn unban_hwid(&self, hwid: &str) -> Result<()> {
        self.banned_hwids.remove(hwid);
        Ok(())
    }

    async fn store_refresh_token(&self, record: &RefreshTokenRecord) -> Result<()> {
        self.refresh_tokens.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_refresh_token(&self, token_id: &str) -> Result<Option<RefreshTokenRecord>> {
        Ok(self.refresh_tokens.get(token_id).map(|r| r.value().clone()))
    }

    async fn revoke_refresh_token(&self, token_id: &str) -> Result<bool> {
        match self.refresh_tokens.get_mut(token_id) {
            Some(mut record) if record.revoked_at.is_none() => {
                record.revoked_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_refresh_tokens(&self, user_id: &str) -> Result<u64> {
        let now = Utc::now();
        let mut revoked = 0;
        for mut record in self.refresh_tokens.iter_mut() {
            if record.user_id == user_id && record.revoked_at.is_none() {
                record.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn purge_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut purged = 0;
        self.refresh_tokens.retain(|_, record| {
            let live = record.expires_at > now;
            if !live {
                purged += 1;
            }
            live
        });
        Ok(purged)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;

    fn record(id: &str, user_id: &str) -> RefreshTokenRecord {
        let now = Utc::now();
        RefreshTokenRecord {
            id: id.into(),
            user_id: user_id.into(),
            token_hash: "abc".into(),
            expires_at: now + Duration::days(7),
            created_at: now,
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn concurrent_ip_bans_admit_exactly_one() {
        let repo = Arc::new(MemoryRepository::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move { repo.ban_ip("10.1.1.1").await }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn revoke_refresh_token_once() {
        let repo = MemoryRepository::new();
        repo.store_refresh_token(&record("t1", "u1")).await.unwrap();
        assert!(repo.revoke_refresh_token("t1").await.unwrap());
        assert!(!repo.revoke_refresh_token("t1").await.unwrap());
        assert!(!repo.revoke_refresh_token("missing").await.unwrap());
        assert!(repo.find_refresh_token("t1").await.unwrap().unwrap().is_revoked());
    }

    #[tokio::test]
    async fn revoke_all_only_touches_the_user() {
        let repo = MemoryRepository::new();
        repo.store_refresh_token(&record("t1", "u1")).await.unwrap();
        repo.store_refresh_token(&record("t2", "u1")).await.unwrap();
        repo.store_refresh_token(&record("t3", "u2")).await.unwrap();
        assert_eq!(repo.revoke_all_refresh_tokens("u1").await.unwrap(), 2);
        assert!(!repo.find_refresh_token("t3").await.unwrap().unwrap().is_revoked());
    }

    #[tokio::test]
    async fn purge_drops_only_expired_records() {
        let repo = MemoryRepository::new();
        let mut stale = record("old", "u1");
        stale.expires_at = Utc::now() - Duration::seconds(1);
        repo.store_refresh_token(&stale).await.unwrap();
        repo.store_refresh_token(&record("fresh", "u1")).await.unwrap();

        assert_eq!(repo.purge_expired_refresh_tokens(Utc::now()).await.unwrap(), 1);
        assert!(repo.find_refresh_token("old").await.unwrap().is_none());
        assert!(repo.find_refresh_token("fresh").await.unwrap().is_some());
        assert_eq!(repo.purge_expired_refresh_tokens(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repository_behaviour() {
        crate::store::testing::exercise_repository(&MemoryRepository::new()).await;
    }
}

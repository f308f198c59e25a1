//! Redis repository.
//!
//! Key layout, all under a configurable prefix `{p}`:
//!
//! | key                    | type | contents                                  |
//! |------------------------|------|-------------------------------------------|
//! | `{p}:user:{id}`        | hash | user fields                               |
//! | `{p}:users:by_name`    | hash | username -> id                            |
//! | `{p}:banned_ips`       | set  | normalised IPs                            |
//! | `{p}:banned_hwids`     | set  | hardware ids                              |
//! | `{p}:refresh:{id}`     | hash | refresh record, expires with the token    |
//! | `{p}:user:{id}:refresh`| set  | refresh record ids of a user              |
//!
//! Multi-key mutations run as Lua scripts so they stay atomic on the server.
//! Refresh hashes expire on their own; the per-user id sets are pruned by
//! [`Repository::purge_expired_refresh_tokens`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::debug;

use super::{Repository, Result, StoreError};
use crate::models::auth::{NewUser, RefreshTokenRecord, User, UserWithPassword};
use crate::models::ban::BanTarget;

const INSERT_USER: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('HSET', KEYS[2],
  'id', ARGV[2], 'username', ARGV[1], 'password_hash', ARGV[3],
  'token_generation', 0, 'banned', 0, 'created_at', ARGV[4])
return 1
"#;

const BAN_USER: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
if redis.call('HGET', KEYS[1], 'banned') == '1' then
  return 0
end
redis.call('HSET', KEYS[1], 'banned', 1)
return 1
"#;

const UNBAN_USER: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('HSET', KEYS[1], 'banned', 0)
end
return 1
"#;

const BUMP_GENERATION: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
return redis.call('HINCRBY', KEYS[1], 'token_generation', 1)
"#;

const REVOKE_ONE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
if redis.call('HEXISTS', KEYS[1], 'revoked_at') == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'revoked_at', ARGV[1])
return 1
"#;

const REVOKE_ALL: &str = r#"
local revoked = 0
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local key = ARGV[1] .. id
  if redis.call('EXISTS', key) == 0 then
    redis.call('SREM', KEYS[1], id)
  elseif redis.call('HEXISTS', key, 'revoked_at') == 0 then
    redis.call('HSET', key, 'revoked_at', ARGV[2])
    revoked = revoked + 1
  end
end
return revoked
"#;

const DELETE_USER: &str = r#"
local name = redis.call('HGET', KEYS[1], 'username')
if not name then
  return 0
end
for _, id in ipairs(redis.call('SMEMBERS', KEYS[3])) do
  redis.call('DEL', ARGV[1] .. id)
end
redis.call('DEL', KEYS[1], KEYS[3])
if redis.call('HGET', KEYS[2], name) == ARGV[2] then
  redis.call('HDEL', KEYS[2], name)
end
return 1
"#;

const PRUNE_REFRESH_SET: &str = r#"
local pruned = 0
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. id) == 0 then
    redis.call('SREM', KEYS[1], id)
    pruned = pruned + 1
  end
end
return pruned
"#;

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 200;

/// Key builder for one prefix.
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn user(&self, id: &str) -> String {
        format!("{}:user:{id}", self.prefix)
    }

    fn users_by_name(&self) -> String {
        format!("{}:users:by_name", self.prefix)
    }

    fn banned(&self, target: BanTarget) -> String {
        match target {
            BanTarget::User => format!("{}:banned_users", self.prefix),
            BanTarget::Ip => format!("{}:banned_ips", self.prefix),
            BanTarget::Hwid => format!("{}:banned_hwids", self.prefix),
        }
    }

    fn refresh_prefix(&self) -> String {
        format!("{}:refresh:", self.prefix)
    }

    fn refresh(&self, id: &str) -> String {
        format!("{}{id}", self.refresh_prefix())
    }

    fn user_refresh(&self, user_id: &str) -> String {
        format!("{}:user:{user_id}:refresh", self.prefix)
    }

    fn user_refresh_pattern(&self) -> String {
        format!("{}:user:*:refresh", self.prefix)
    }
}

fn field<'a>(hash: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    hash.get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Unavailable(format!("corrupt record: missing {name}")))
}

fn timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("corrupt timestamp {raw:?}: {e}")))
}

fn user_from_hash(hash: &HashMap<String, String>) -> Result<UserWithPassword> {
    let token_generation = field(hash, "token_generation")?
        .parse::<i64>()
        .map_err(|e| StoreError::Unavailable(format!("corrupt token_generation: {e}")))?;
    Ok(UserWithPassword {
        user: User {
            id: field(hash, "id")?.to_string(),
            username: field(hash, "username")?.to_string(),
            token_generation,
            banned: field(hash, "banned")? == "1",
            created_at: timestamp(field(hash, "created_at")?)?,
        },
        password_hash: field(hash, "password_hash")?.to_string(),
    })
}

fn refresh_from_hash(hash: &HashMap<String, String>) -> Result<RefreshTokenRecord> {
    Ok(RefreshTokenRecord {
        id: field(hash, "id")?.to_string(),
        user_id: field(hash, "user_id")?.to_string(),
        token_hash: field(hash, "token_hash")?.to_string(),
        expires_at: timestamp(field(hash, "expires_at")?)?,
        created_at: timestamp(field(hash, "created_at")?)?,
        revoked_at: hash.get("revoked_at").map(|t| timestamp(t)).transpose()?,
    })
}

/// Repository over a Redis server.
#[derive(Clone)]
pub struct RedisRepository {
    conn: ConnectionManager,
    keys: Keys,
}

impl RedisRepository {
    /// Connect to `url` and verify the server answers.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let repo = Self {
            conn,
            keys: Keys {
                prefix: key_prefix.to_string(),
            },
        };
        repo.ping().await?;
        debug!(prefix = key_prefix, "redis connection established");
        Ok(repo)
    }

    async fn load_user(&self, id: &str) -> Result<Option<UserWithPassword>> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.user(id))
            .query_async(&mut conn)
            .await?;
        if hash.is_empty() {
            return Ok(None);
        }
        user_from_hash(&hash).map(Some)
    }

    async fn add_ban(&self, target: BanTarget, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let added: i64 = redis::cmd("SADD")
            .arg(self.keys.banned(target))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        if added == 0 {
            return Err(StoreError::AlreadyBanned(target));
        }
        Ok(())
    }

    async fn remove_ban(&self, target: BanTarget, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SREM")
            .arg(self.keys.banned(target))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Every per-user refresh set under the prefix.
    async fn refresh_sets(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = self.keys.user_refresh_pattern();
        let mut sets = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            sets.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        sets.sort_unstable();
        sets.dedup();
        Ok(sets)
    }

    async fn has_ban(&self, target: BanTarget, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let present: bool = redis::cmd("SISMEMBER")
            .arg(self.keys.banned(target))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(present)
    }
}

#[async_trait]
impl Repository for RedisRepository {
    async fn insert_user(&self, user: &NewUser) -> Result<()> {
        let mut conn = self.conn.clone();
        let inserted: i64 = redis::cmd("EVAL")
            .arg(INSERT_USER)
            .arg(2)
            .arg(self.keys.users_by_name())
            .arg(self.keys.user(&user.id))
            .arg(&user.username)
            .arg(&user.id)
            .arg(&user.password_hash)
            .arg(user.created_at.to_rfc3339())
            .query_async(&mut conn)
            .await?;
        if inserted == 0 {
            return Err(StoreError::UsernameTaken(user.username.clone()));
        }
        Ok(())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.load_user(user_id).await?.map(|u| u.user))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserWithPassword>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = redis::cmd("HGET")
            .arg(self.keys.users_by_name())
            .arg(username)
            .query_async(&mut conn)
            .await?;
        match id {
            Some(id) => self.load_user(&id).await,
            None => Ok(None),
        }
    }

    async fn ban_user(&self, user_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let outcome: i64 = redis::cmd("EVAL")
            .arg(BAN_USER)
            .arg(1)
            .arg(self.keys.user(user_id))
            .query_async(&mut conn)
            .await?;
        match outcome {
            -1 => Err(StoreError::UserNotFound(user_id.to_string())),
            0 => Err(StoreError::AlreadyBanned(BanTarget::User)),
            _ => Ok(()),
        }
    }

    async fn unban_user(&self, user_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("EVAL")
            .arg(UNBAN_USER)
            .arg(1)
            .arg(self.keys.user(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("EVAL")
            .arg(DELETE_USER)
            .arg(3)
            .arg(self.keys.user(user_id))
            .arg(self.keys.users_by_name())
            .arg(self.keys.user_refresh(user_id))
            .arg(self.keys.refresh_prefix())
            .arg(user_id)
            .query_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn bump_token_generation(&self, user_id: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let generation: Option<i64> = redis::cmd("EVAL")
            .arg(BUMP_GENERATION)
            .arg(1)
            .arg(self.keys.user(user_id))
            .query_async(&mut conn)
            .await?;
        generation.ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
    }

    async fn is_ip_banned(&self, ip: &str) -> Result<bool> {
        self.has_ban(BanTarget::Ip, ip).await
    }

    async fn ban_ip(&self, ip: &str) -> Result<()> {
        self.add_ban(BanTarget::Ip, ip).await
    }

    async fn unban_ip(&self, ip: &str) -> Result<()> {
        self.remove_ban(BanTarget::Ip, ip).await
    }

    async fn is_hwid_banned(&self, hwid: &str) -> Result<bool> {
        self.has_ban(BanTarget::Hwid, hwid).await
    }

    async fn ban_hwid(&self, hwid: &str) -> Result<()> {
        self.add_ban(BanTarget::Hwid, hwid).await
    }

    async fn unban_hwid(&self, hwid: &str) -> Result<()> {
        self.remove_ban(BanTarget::Hwid, hwid).await
    }

    async fn store_refresh_token(&self, record: &RefreshTokenRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.refresh(&record.id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("id")
            .arg(&record.id)
            .arg("user_id")
            .arg(&record.user_id)
            .arg("token_hash")
            .arg(&record.token_hash)
            .arg("expires_at")
            .arg(record.expires_at.to_rfc3339())
            .arg("created_at")
            .arg(record.created_at.to_rfc3339())
            .ignore();
        if let Some(revoked_at) = record.revoked_at {
            pipe.cmd("HSET")
                .arg(&key)
                .arg("revoked_at")
                .arg(revoked_at.to_rfc3339())
                .ignore();
        }
        pipe.cmd("EXPIREAT")
            .arg(&key)
            .arg(record.expires_at.timestamp())
            .ignore()
            .cmd("SADD")
            .arg(self.keys.user_refresh(&record.user_id))
            .arg(&record.id)
            .ignore();

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn find_refresh_token(&self, token_id: &str) -> Result<Option<RefreshTokenRecord>> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.refresh(token_id))
            .query_async(&mut conn)
            .await?;
        if hash.is_empty() {
            return Ok(None);
        }
        refresh_from_hash(&hash).map(Some)
    }

    async fn revoke_refresh_token(&self, token_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let revoked: i64 = redis::cmd("EVAL")
            .arg(REVOKE_ONE)
            .arg(1)
            .arg(self.keys.refresh(token_id))
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await?;
        Ok(revoked == 1)
    }

    async fn revoke_all_refresh_tokens(&self, user_id: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let revoked: u64 = redis::cmd("EVAL")
            .arg(REVOKE_ALL)
            .arg(1)
            .arg(self.keys.user_refresh(user_id))
            .arg(self.keys.refresh_prefix())
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await?;
        Ok(revoked)
    }

    async fn purge_expired_refresh_tokens(&self, _now: DateTime<Utc>) -> Result<u64> {
        // The hashes themselves carry EXPIREAT; only dangling ids remain.
        let mut pruned = 0;
        for set in self.refresh_sets().await? {
            let mut conn = self.conn.clone();
            let removed: u64 = redis::cmd("EVAL")
                .arg(PRUNE_REFRESH_SET)
                .arg(1)
                .arg(&set)
                .arg(self.keys.refresh_prefix())
                .query_async(&mut conn)
                .await?;
            pruned += removed;
        }
        Ok(pruned)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Keys {
        Keys {
            prefix: "warden".into(),
        }
    }

    #[test]
    fn keys_share_the_prefix() {
        let keys = keys();
        assert_eq!(keys.user("u1"), "warden:user:u1");
        assert_eq!(keys.users_by_name(), "warden:users:by_name");
        assert_eq!(keys.banned(BanTarget::Ip), "warden:banned_ips");
        assert_eq!(keys.banned(BanTarget::Hwid), "warden:banned_hwids");
        assert_eq!(keys.refresh("t1"), "warden:refresh:t1");
        assert_eq!(keys.user_refresh("u1"), "warden:user:u1:refresh");
        assert_eq!(keys.user_refresh_pattern(), "warden:user:*:refresh");
    }

    #[test]
    fn user_hash_parses() {
        let created = Utc::now();
        let hash: HashMap<String, String> = [
            ("id", "u1"),
            ("username", "alice"),
            ("password_hash", "$2b$10$x"),
            ("token_generation", "3"),
            ("banned", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain([("created_at".to_string(), created.to_rfc3339())])
        .collect();

        let parsed = user_from_hash(&hash).unwrap();
        assert_eq!(parsed.user.username, "alice");
        assert_eq!(parsed.user.token_generation, 3);
        assert!(parsed.user.banned);
        assert_eq!(parsed.user.created_at, created);
    }

    #[test]
    fn incomplete_user_hash_is_unavailable() {
        let hash: HashMap<String, String> =
            [("id".to_string(), "u1".to_string())].into_iter().collect();
        assert!(matches!(
            user_from_hash(&hash),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn refresh_hash_without_revocation_is_live() {
        let now = Utc::now();
        let hash: HashMap<String, String> = [
            ("id", "t1".to_string()),
            ("user_id", "u1".to_string()),
            ("token_hash", "abc".to_string()),
            ("expires_at", now.to_rfc3339()),
            ("created_at", now.to_rfc3339()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let record = refresh_from_hash(&hash).unwrap();
        assert!(!record.is_revoked());
        assert_eq!(record.expires_at, now);
    }
    /// Runs against the server in `REDIS_URL`, skipped when unset. Each run
    /// gets its own key prefix.
    #[tokio::test]
    async fn repository_behaviour() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            eprintln!("REDIS_URL not set, skipping");
            return;
        };
        let prefix = format!("warden-test-{}", crate::uuid::new_id());
        let repo = RedisRepository::connect(&url, &prefix).await.unwrap();
        crate::store::testing::exercise_repository(&repo).await;
    }
}

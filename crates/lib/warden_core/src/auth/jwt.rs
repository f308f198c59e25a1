//! JWT token generation and verification.
//!
//! Tokens are HS256 only. Expiry and not-before are checked against the
//! service's [`Clock`], not inside `jsonwebtoken`. Refresh tokens also need a
//! live record in the credential store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::TokenError;
use crate::clock::{Clock, SystemClock};
use crate::config::AuthSettings;
use crate::models::auth::{RefreshTokenRecord, TokenClaims, TokenKind, TokenPair, User};
use crate::store::CredentialStore;
use crate::uuid::new_id;

/// Value of `token_type` in every issued pair.
pub const BEARER: &str = "Bearer";

/// SHA-256 hex digest of a token, as kept in refresh records.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> TokenError {
    match e.kind() {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => TokenError::SignatureInvalid,
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::ImmatureSignature => TokenError::NotYetValid,
        _ => TokenError::Malformed(e.to_string()),
    }
}

/// Mints and validates access/refresh token pairs.
#[derive(Clone)]
pub struct TokenService {
    settings: Arc<AuthSettings>,
    store: CredentialStore,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(settings: Arc<AuthSettings>, store: CredentialStore) -> Self {
        Self::with_clock(settings, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: Arc<AuthSettings>,
        store: CredentialStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            store,
            clock,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    fn secret(&self) -> Result<&[u8], TokenError> {
        if self.settings.signing_secret.is_empty() {
            return Err(TokenError::SecretUnavailable);
        }
        Ok(&self.settings.signing_secret)
    }

    fn mint(
        &self,
        user: &User,
        kind: TokenKind,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(String, TokenClaims), TokenError> {
        let claims = TokenClaims {
            jti: new_id(),
            sub: user.id.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + ttl).timestamp(),
            token_type: kind,
            ver: user.token_generation,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret()?),
        )
        .map_err(|e| TokenError::Signing(e.to_string()))?;
        Ok((token, claims))
    }

    /// Issue an access/refresh pair for `user` and persist the refresh record.
    pub async fn issue_token_pair(&self, user: &User) -> Result<TokenPair, TokenError> {
        self.secret()?;
        let now = self.clock.now();

        let (access_token, _) = self.mint(user, TokenKind::Access, now, self.settings.access_ttl)?;
        let (refresh_token, refresh_claims) =
            self.mint(user, TokenKind::Refresh, now, self.settings.refresh_ttl)?;

        let record = RefreshTokenRecord {
            id: refresh_claims.jti,
            user_id: user.id.clone(),
            token_hash: hash_token(&refresh_token),
            expires_at: now + self.settings.refresh_ttl,
            created_at: now,
            revoked_at: None,
        };
        self.store.store_refresh_token(&record).await?;
        debug!(user_id = %user.id, refresh_id = %record.id, "issued token pair");

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: BEARER.to_string(),
            expires_in: self.settings.access_ttl.num_seconds(),
        })
    }

    /// Verify signature, lifetime and kind. Does not consult the store.
    pub fn decode_claims(
        &self,
        token: &str,
        expected: TokenKind,
    ) -> Result<TokenClaims, TokenError> {
        let key = DecodingKey::from_secret(self.secret()?);
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

        let claims = decode::<TokenClaims>(token, &key, &validation)
            .map_err(map_jwt_error)?
            .claims;

        let now = self.clock.now().timestamp();
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        if claims.nbf > now {
            return Err(TokenError::NotYetValid);
        }
        if claims.token_type != expected {
            return Err(TokenError::WrongKind {
                expected,
                found: claims.token_type,
            });
        }
        Ok(claims)
    }

    /// Full validation. Refresh tokens must match a live stored record.
    pub async fn validate_token(
        &self,
        token: &str,
        expected: TokenKind,
    ) -> Result<TokenClaims, TokenError> {
        let claims = self.decode_claims(token, expected)?;
        if expected == TokenKind::Refresh {
            let live = self
                .store
                .find_refresh_token(&claims.jti)
                .await?
                .is_some_and(|r| {
                    !r.is_revoked() && r.user_id == claims.sub && r.token_hash == hash_token(token)
                });
            if !live {
                return Err(TokenError::Revoked);
            }
        }
        Ok(claims)
    }

    /// Revoke one refresh token by id. Returns whether a live record changed.
    pub async fn revoke_refresh_token(&self, token_id: &str) -> Result<bool, TokenError> {
        let revoked = self.store.revoke_refresh_token(token_id).await?;
        if revoked {
            debug!(refresh_id = token_id, "refresh token revoked");
        }
        Ok(revoked)
    }

    /// Kill every outstanding token of a user: bump the generation, which
    /// invalidates access tokens, and revoke all refresh records.
    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64, TokenError> {
        let generation = self.store.bump_token_generation(user_id).await?;
        let revoked = self.store.revoke_all_refresh_tokens(user_id).await?;
        info!(user_id, generation, revoked, "revoked all sessions");
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryRepository, StoreError};

    struct Fixture {
        tokens: TokenService,
        clock: ManualClock,
        user: User,
    }

    async fn fixture() -> Fixture {
        let store = CredentialStore::new(
            Arc::new(MemoryRepository::new()),
            StdDuration::from_secs(5),
        );
        let id = store.create_user("u1", "pw").await.unwrap();
        let user = store.find_user(&id).await.unwrap().unwrap();
        let clock = ManualClock::new(Utc::now());
        let settings = AuthSettings::new(b"test-secret-test-secret-32-bytes".to_vec(), "Test/1.0");
        let tokens = TokenService::with_clock(Arc::new(settings), store, Arc::new(clock.clone()));
        Fixture {
            tokens,
            clock,
            user,
        }
    }

    fn tamper(token: &str) -> String {
        let (head, signature) = token.rsplit_once('.').unwrap();
        let mut chars: Vec<char> = signature.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        format!("{head}.{}", chars.into_iter().collect::<String>())
    }

    #[tokio::test]
    async fn access_token_validates_to_subject() {
        let f = fixture().await;
        let pair = f.tokens.issue_token_pair(&f.user).await.unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 900);

        let claims = f
            .tokens
            .validate_token(&pair.access_token, TokenKind::Access)
            .await
            .unwrap();
        assert_eq!(claims.sub, f.user.id);
        assert_eq!(claims.token_type, TokenKind::Access);
    }

    #[tokio::test]
    async fn kinds_are_not_interchangeable() {
        let f = fixture().await;
        let pair = f.tokens.issue_token_pair(&f.user).await.unwrap();

        assert!(matches!(
            f.tokens.validate_token(&pair.refresh_token, TokenKind::Access).await,
            Err(TokenError::WrongKind {
                expected: TokenKind::Access,
                found: TokenKind::Refresh
            })
        ));
        assert!(matches!(
            f.tokens.validate_token(&pair.access_token, TokenKind::Refresh).await,
            Err(TokenError::WrongKind {
                expected: TokenKind::Refresh,
                found: TokenKind::Access
            })
        ));
    }

    #[tokio::test]
    async fn access_expires_before_refresh() {
        let f = fixture().await;
        let pair = f.tokens.issue_token_pair(&f.user).await.unwrap();

        f.clock.advance(Duration::minutes(16));
        assert!(matches!(
            f.tokens.validate_token(&pair.access_token, TokenKind::Access).await,
            Err(TokenError::Expired)
        ));
        f.tokens
            .validate_token(&pair.refresh_token, TokenKind::Refresh)
            .await
            .unwrap();

        f.clock.advance(Duration::days(7));
        assert!(matches!(
            f.tokens.validate_token(&pair.refresh_token, TokenKind::Refresh).await,
            Err(TokenError::Expired)
        ));
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let f = fixture().await;
        let pair = f.tokens.issue_token_pair(&f.user).await.unwrap();
        assert!(matches!(
            f.tokens
                .validate_token(&tamper(&pair.access_token), TokenKind::Access)
                .await,
            Err(TokenError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn other_secret_is_rejected() {
        let f = fixture().await;
        let pair = f.tokens.issue_token_pair(&f.user).await.unwrap();

        let other = TokenService::new(
            Arc::new(AuthSettings::new(b"another-secret".to_vec(), "Test/1.0")),
            f.tokens.credentials().clone(),
        );
        assert!(matches!(
            other.decode_claims(&pair.access_token, TokenKind::Access),
            Err(TokenError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn other_algorithms_are_rejected() {
        let f = fixture().await;
        let now = f.clock.now();
        let claims = TokenClaims {
            jti: new_id(),
            sub: f.user.id.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + Duration::minutes(5)).timestamp(),
            token_type: TokenKind::Access,
            ver: 0,
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(&f.tokens.settings().signing_secret),
        )
        .unwrap();
        assert!(matches!(
            f.tokens.decode_claims(&token, TokenKind::Access),
            Err(TokenError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let f = fixture().await;
        assert!(matches!(
            f.tokens.decode_claims("not-a-jwt", TokenKind::Access),
            Err(TokenError::Malformed(_))
        ));
        // {"alg":"none","typ":"JWT"}
        let unsigned = "eyJhbGciOiJub25lIiwidHlwIjoiSldUIn0.eyJzdWIiOiJ1MSJ9.";
        assert!(matches!(
            f.tokens.decode_claims(unsigned, TokenKind::Access),
            Err(TokenError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn future_not_before_is_rejected() {
        let f = fixture().await;
        let now = f.clock.now();
        let claims = TokenClaims {
            jti: new_id(),
            sub: f.user.id.clone(),
            iat: now.timestamp(),
            nbf: (now + Duration::minutes(1)).timestamp(),
            exp: (now + Duration::minutes(5)).timestamp(),
            token_type: TokenKind::Access,
            ver: 0,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&f.tokens.settings().signing_secret),
        )
        .unwrap();
        assert!(matches!(
            f.tokens.decode_claims(&token, TokenKind::Access),
            Err(TokenError::NotYetValid)
        ));
        f.clock.advance(Duration::minutes(2));
        f.tokens.decode_claims(&token, TokenKind::Access).unwrap();
    }

    #[tokio::test]
    async fn revoked_refresh_token_fails() {
        let f = fixture().await;
        let pair = f.tokens.issue_token_pair(&f.user).await.unwrap();
        let claims = f
            .tokens
            .validate_token(&pair.refresh_token, TokenKind::Refresh)
            .await
            .unwrap();

        assert!(f.tokens.revoke_refresh_token(&claims.jti).await.unwrap());
        assert!(matches!(
            f.tokens.validate_token(&pair.refresh_token, TokenKind::Refresh).await,
            Err(TokenError::Revoked)
        ));
        // signature and expiry are still fine
        f.tokens
            .decode_claims(&pair.refresh_token, TokenKind::Refresh)
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_record_keeps_only_the_hash() {
        let f = fixture().await;
        let pair = f.tokens.issue_token_pair(&f.user).await.unwrap();
        let claims = f
            .tokens
            .decode_claims(&pair.refresh_token, TokenKind::Refresh)
            .unwrap();
        let record = f
            .tokens
            .credentials()
            .find_refresh_token(&claims.jti)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(record.token_hash, pair.refresh_token);
        assert_eq!(record.token_hash, hash_token(&pair.refresh_token));
        assert_eq!(record.token_hash.len(), 64);
    }

    #[tokio::test]
    async fn revoke_all_bumps_generation() {
        let f = fixture().await;
        let first = f.tokens.issue_token_pair(&f.user).await.unwrap();
        f.tokens.issue_token_pair(&f.user).await.unwrap();

        assert_eq!(f.tokens.revoke_all_for_user(&f.user.id).await.unwrap(), 2);
        let user = f
            .tokens
            .credentials()
            .find_user(&f.user.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.token_generation, 1);

        let stale = f
            .tokens
            .decode_claims(&first.access_token, TokenKind::Access)
            .unwrap();
        assert_ne!(stale.ver, user.token_generation);
        assert!(matches!(
            f.tokens.validate_token(&first.refresh_token, TokenKind::Refresh).await,
            Err(TokenError::Revoked)
        ));
    }

    #[tokio::test]
    async fn revoke_all_for_unknown_user_fails() {
        let f = fixture().await;
        assert!(matches!(
            f.tokens.revoke_all_for_user("nobody").await,
            Err(TokenError::Store(StoreError::UserNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn empty_secret_is_unavailable() {
        let f = fixture().await;
        let broken = TokenService::new(
            Arc::new(AuthSettings::new(Vec::new(), "Test/1.0")),
            f.tokens.credentials().clone(),
        );
        assert!(matches!(
            broken.issue_token_pair(&f.user).await,
            Err(TokenError::SecretUnavailable)
        ));
        assert!(matches!(
            broken.decode_claims("a.b.c", TokenKind::Access),
            Err(TokenError::SecretUnavailable)
        ));
    }
}

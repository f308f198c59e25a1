//! Authentication flows: register, login, refresh rotation and logout.
//!
//! Handlers run these only after the gate has allowed the request.

use tracing::{debug, info};
use warden_core::auth::jwt::TokenService;
use warden_core::models::auth::{TokenKind, TokenPair, User};

use crate::error::{AppError, AppResult};
use crate::models::LogoutResponse;

/// Minimum accepted password length at registration.
pub const MIN_PASSWORD_LEN: usize = 8;

fn invalid_refresh() -> AppError {
    AppError::Unauthorized("Invalid refresh token".into())
}

async fn issue_for_active(tokens: &TokenService, user: &User) -> AppResult<TokenPair> {
    if user.banned {
        return Err(AppError::Forbidden("Account banned".into()));
    }
    Ok(tokens.issue_token_pair(user).await?)
}

/// Register a new user account and log it in.
pub async fn register(tokens: &TokenService, username: &str, password: &str) -> AppResult<TokenPair> {
    let username = username.trim();
    if username.is_empty() {
        return Err(AppError::Validation("Username must not be empty".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let store = tokens.credentials();
    let user_id = store.create_user(username, password).await?;
    let user = store
        .find_user(&user_id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("user {user_id} missing after insert")))?;
    info!(user_id = %user.id, "user registered");

    issue_for_active(tokens, &user).await
}

/// Authenticate with username + password.
pub async fn login(tokens: &TokenService, username: &str, password: &str) -> AppResult<TokenPair> {
    let user = tokens
        .credentials()
        .authenticate(username, password)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid credentials".into()))?;
    debug!(user_id = %user.id, "login");
    issue_for_active(tokens, &user).await
}

/// Exchange a refresh token for a new pair (single-use rotation).
pub async fn refresh(tokens: &TokenService, refresh_token: &str) -> AppResult<TokenPair> {
    let claims = tokens.validate_token(refresh_token, TokenKind::Refresh).await?;

    let user = tokens
        .credentials()
        .find_user(&claims.sub)
        .await?
        .ok_or_else(invalid_refresh)?;
    if user.token_generation != claims.ver {
        return Err(invalid_refresh());
    }

    // Losing a concurrent rotation means the token was already spent.
    if !tokens.revoke_refresh_token(&claims.jti).await? {
        return Err(invalid_refresh());
    }

    issue_for_active(tokens, &user).await
}

/// Revoke the presented refresh token, if any. Always succeeds for the caller.
pub async fn logout(tokens: &TokenService, refresh_token: Option<&str>) -> AppResult<LogoutResponse> {
    if let Some(token) = refresh_token {
        match tokens.decode_claims(token, TokenKind::Refresh) {
            Ok(claims) => {
                tokens.revoke_refresh_token(&claims.jti).await?;
            }
            Err(e) => debug!(error = %e, "logout with unusable refresh token"),
        }
    }
    Ok(LogoutResponse { success: true })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use warden_core::config::AuthSettings;
    use warden_core::store::{CredentialStore, MemoryRepository};

    use super::*;

    fn tokens() -> TokenService {
        let store = CredentialStore::new(Arc::new(MemoryRepository::new()), Duration::from_secs(5));
        TokenService::new(Arc::new(AuthSettings::new(b"svc-secret".to_vec(), "T")), store)
    }

    #[tokio::test]
    async fn register_then_login() {
        let tokens = tokens();
        register(&tokens, "alice", "pw123456").await.unwrap();
        let pair = login(&tokens, "alice", "pw123456").await.unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert!(matches!(
            login(&tokens, "alice", "wrong-password").await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn short_password_is_rejected() {
        assert!(matches!(
            register(&tokens(), "bob", "short").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let tokens = tokens();
        register(&tokens, "carol", "pw123456").await.unwrap();
        assert!(matches!(
            register(&tokens, "carol", "pw123456").await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_once() {
        let tokens = tokens();
        let pair = register(&tokens, "dave", "pw123456").await.unwrap();
        let rotated = refresh(&tokens, &pair.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, pair.refresh_token);
        assert!(matches!(
            refresh(&tokens, &pair.refresh_token).await,
            Err(AppError::Unauthorized(_))
        ));
        refresh(&tokens, &rotated.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn banned_user_cannot_login_or_refresh() {
        let tokens = tokens();
        let pair = register(&tokens, "erin", "pw123456").await.unwrap();
        let user = tokens
            .credentials()
            .find_user_by_username("erin")
            .await
            .unwrap()
            .unwrap();
        tokens.credentials().ban_user(&user.id).await.unwrap();

        assert!(matches!(
            login(&tokens, "erin", "pw123456").await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            refresh(&tokens, &pair.refresh_token).await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn logout_revokes_refresh_token() {
        let tokens = tokens();
        let pair = register(&tokens, "frank", "pw123456").await.unwrap();
        assert!(logout(&tokens, Some(&pair.refresh_token)).await.unwrap().success);
        assert!(refresh(&tokens, &pair.refresh_token).await.is_err());
        assert!(logout(&tokens, Some("garbage")).await.unwrap().success);
        assert!(logout(&tokens, None).await.unwrap().success);
    }
}

//! Token issuance, password hashing and signing secrets.
//!
//! [`jwt::TokenService`] is shared by the HTTP gate and the auth handlers.
//! Password and secret helpers are plain functions.

pub mod jwt;
pub mod password;
pub mod secret;

use thiserror::Error;

use crate::models::auth::TokenKind;
use crate::store::StoreError;

/// Token issuance and validation errors.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Invalid token signature")]
    SignatureInvalid,

    #[error("Token expired")]
    Expired,

    #[error("Token not yet valid")]
    NotYetValid,

    #[error("Wrong token kind: expected {expected}, found {found}")]
    WrongKind { expected: TokenKind, found: TokenKind },

    #[error("Token revoked")]
    Revoked,

    #[error("Signing secret unavailable")]
    SecretUnavailable,

    #[error("Token signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

//! Signing secret generation and decoding.
//!
//! Secrets live in the config file as base64url (with padding) text and
//! are decoded to raw bytes once at startup.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::TryRngCore;
use rand::rngs::OsRng;
use thiserror::Error;

/// Default secret length used when seeding a fresh config file.
pub const DEFAULT_SECRET_BYTES: usize = 32;

/// Errors from secret handling.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("signing secret is empty")]
    Empty,

    #[error("signing secret is not valid base64url: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("entropy source failed: {0}")]
    Entropy(String),
}

/// Generate a random secret of `byte_len` bytes, base64url encoded.
///
/// Reads straight from the operating system RNG. An error here means the
/// entropy source is broken and callers should treat it as fatal.
pub fn generate_secret(byte_len: usize) -> Result<String, SecretError> {
    let mut bytes = vec![0u8; byte_len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| SecretError::Entropy(e.to_string()))?;
    Ok(URL_SAFE.encode(&bytes))
}

/// Decode a base64url secret from configuration into raw key bytes.
pub fn decode_secret(encoded: &str) -> Result<Vec<u8>, SecretError> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Err(SecretError::Empty);
    }
    let bytes = URL_SAFE.decode(trimmed)?;
    if bytes.is_empty() {
        return Err(SecretError::Empty);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_decodes_to_requested_length() {
        let secret = generate_secret(32).unwrap();
        assert_eq!(decode_secret(&secret).unwrap().len(), 32);
    }

    #[test]
    fn generated_secrets_differ() {
        assert_ne!(generate_secret(16).unwrap(), generate_secret(16).unwrap());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(decode_secret("   "), Err(SecretError::Empty)));
    }

    #[test]
    fn garbage_secret_is_rejected() {
        assert!(matches!(
            decode_secret("not base64 !!"),
            Err(SecretError::Encoding(_))
        ));
    }
}

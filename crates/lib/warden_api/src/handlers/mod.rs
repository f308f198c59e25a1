//! Request handlers.

pub mod auth;
pub mod hello;
pub mod me;

use axum::http::Uri;

use crate::error::AppError;

/// Fallback for unknown paths.
pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}

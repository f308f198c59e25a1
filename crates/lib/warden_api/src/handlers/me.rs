//! `GET /api/me`.

use axum::extract::State;
use axum::{Extension, Json};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::gate::Authenticated;
use crate::models::MeResponse;

/// Returns the user behind the access token.
pub async fn me_handler(
    State(state): State<AppState>,
    Extension(Authenticated(claims)): Extension<Authenticated>,
) -> AppResult<Json<MeResponse>> {
    let user = state
        .credentials()
        .find_user(&claims.sub)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Unknown user".into()))?;
    Ok(Json(MeResponse {
        id: user.id,
        username: user.username,
        created_at: user.created_at.to_rfc3339(),
    }))
}

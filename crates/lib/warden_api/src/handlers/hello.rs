//! Hello world endpoint: bootstrap health check.

use axum::Json;
use axum::extract::State;
use tracing::warn;

use crate::AppState;
use crate::error::AppResult;
use crate::models::HelloWorldResponse;

/// `GET /api/hello`: verifies the core lib and the credential store.
pub async fn hello_world(State(state): State<AppState>) -> AppResult<Json<HelloWorldResponse>> {
    let greeting = warden_core::hello::hello_world();

    let store_connected = match state.credentials().ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("credential store ping failed: {e}");
            false
        }
    };

    Ok(Json(HelloWorldResponse {
        greeting,
        store_connected,
    }))
}

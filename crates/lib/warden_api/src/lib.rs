//! # warden_api
//!
//! HTTP API library for Warden: the route registry, the access gate
//! middleware and the auth handlers.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::handler::Handler;
use axum::middleware::from_fn_with_state;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;
use warden_core::auth::jwt::TokenService;
use warden_core::gate::{AccessGate, RoutePolicy};
use warden_core::store::CredentialStore;

use crate::config::ApiConfig;
use crate::middleware::gate::{GuardedRoute, enforce};
use crate::routes::RouteRegistry;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: AccessGate,
    /// API configuration.
    pub config: Arc<ApiConfig>,
}

impl AppState {
    pub fn new(gate: AccessGate, config: ApiConfig) -> Self {
        Self {
            gate,
            config: Arc::new(config),
        }
    }

    pub fn tokens(&self) -> &TokenService {
        self.gate.tokens()
    }

    pub fn credentials(&self) -> &CredentialStore {
        self.gate.tokens().credentials()
    }
}

/// Builds the Axum router with the default routes.
pub fn router(state: AppState) -> Router {
    router_with(state, routes::default_routes())
}

/// Builds the Axum router from an explicit registry. Every route, and the
/// not-found fallback, sits behind the gate with its own policy.
pub fn router_with(state: AppState, registry: RouteRegistry) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    debug!(routes = registry.len(), "building router");
    let mut app: Router<AppState> = Router::new();
    for spec in registry {
        let guard = GuardedRoute {
            state: state.clone(),
            policy: spec.policy,
        };
        let mut routes: Router<AppState> = Router::new();
        for path in &spec.paths {
            routes = routes.route(path, spec.handler.clone());
        }
        debug!(route = spec.name, paths = ?spec.paths, policy = ?spec.policy, "route registered");
        app = app.merge(routes.route_layer(from_fn_with_state(guard, enforce)));
    }

    let public = GuardedRoute {
        state: state.clone(),
        policy: RoutePolicy::PUBLIC,
    };
    app.fallback(handlers::not_found.layer(from_fn_with_state(public, enforce)))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

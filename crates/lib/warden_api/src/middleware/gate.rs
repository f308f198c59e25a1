//! Access gate middleware.
//!
//! Pulls the caller identity out of the request, asks the core gate for a
//! decision and either runs the handler or answers `403` with no body.

use std::net::SocketAddr;

use axum::RequestExt;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use warden_core::gate::{Decision, RequestIdentity, RoutePolicy};
use warden_core::models::auth::TokenClaims;

use crate::AppState;
use crate::config::ApiConfig;

/// Middleware state: the app plus the policy of the guarded route.
#[derive(Clone)]
pub struct GuardedRoute {
    pub state: AppState,
    pub policy: RoutePolicy,
}

/// Validated token claims, inserted into request extensions on allow.
#[derive(Debug, Clone)]
pub struct Authenticated(pub TokenClaims);

/// Owned copy of what the caller presented.
#[derive(Debug, Default)]
struct CallerIdentity {
    client_tag: Option<String>,
    bearer: Option<String>,
    source_ip: Option<String>,
    hwid: Option<String>,
}

impl CallerIdentity {
    fn as_request(&self) -> RequestIdentity<'_> {
        RequestIdentity {
            client_tag: self.client_tag.as_deref(),
            bearer: self.bearer.as_deref(),
            source_ip: self.source_ip.as_deref(),
            hwid: self.hwid.as_deref(),
        }
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Peer address of the connection. Goes through the `ConnectInfo`
/// extractor so a `MockConnectInfo` layer is honoured too.
async fn peer_addr(request: &mut Request) -> Option<SocketAddr> {
    request
        .extract_parts::<ConnectInfo<SocketAddr>>()
        .await
        .ok()
        .map(|ConnectInfo(addr)| addr)
}

fn source_ip(
    config: &ApiConfig,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Option<String> {
    if config.trust_forwarded_for
        && let Some(forwarded) = header(headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty())
    {
        return Some(first.to_string());
    }
    peer.map(|addr| addr.ip().to_string())
}

fn identify(config: &ApiConfig, headers: &HeaderMap, peer: Option<SocketAddr>) -> CallerIdentity {
    CallerIdentity {
        client_tag: header(headers, &config.client_tag_header),
        bearer: bearer(headers),
        source_ip: source_ip(config, headers, peer),
        hwid: header(headers, &config.hwid_header).filter(|h| !h.is_empty()),
    }
}

/// Axum middleware: runs the gate for the route's policy.
pub async fn enforce(
    State(guard): State<GuardedRoute>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = peer_addr(&mut request).await;
    let caller = identify(&guard.state.config, request.headers(), peer);
    let decision = guard
        .state
        .gate
        .check(&guard.policy, &caller.as_request())
        .await;

    match decision {
        Decision::Allow { claims } => {
            if let Some(claims) = claims {
                request.extensions_mut().insert(Authenticated(claims));
            }
            next.run(request).await
        }
        Decision::Deny(_) => StatusCode::FORBIDDEN.into_response(),
    }
}

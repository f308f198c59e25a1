//! Integration tests: build the router over an in-memory store and drive
//! it with `oneshot`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use warden_api::config::ApiConfig;
use warden_api::{AppState, router};
use warden_core::auth::jwt::TokenService;
use warden_core::config::AuthSettings;
use warden_core::gate::AccessGate;
use warden_core::store::{CredentialStore, MemoryRepository};

const TAG: &str = "Test Client 1.0/b (Software)";
const CLIENT_IP: [u8; 4] = [203, 0, 113, 9];

fn state() -> AppState {
    let store = CredentialStore::new(Arc::new(MemoryRepository::new()), Duration::from_secs(5));
    let settings = AuthSettings::new(b"integration-test-secret".to_vec(), TAG);
    let gate = AccessGate::new(TokenService::new(Arc::new(settings), store));
    AppState::new(gate, ApiConfig::default())
}

fn app(state: &AppState) -> Router {
    router(state.clone()).layer(MockConnectInfo(SocketAddr::from((CLIENT_IP, 40000))))
}

fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("GET").uri(uri)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("user-agent", TAG)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app(state).oneshot(req).await.expect("request");
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("read body");
    (status, body.to_vec())
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).expect("parse JSON")
}

async fn register(state: &AppState, username: &str) -> serde_json::Value {
    let (status, body) = send(
        state,
        post_json(
            "/auth/register",
            serde_json::json!({ "username": username, "password": "pw123456" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    json(&body)
}

#[tokio::test]
async fn hello_endpoint_returns_expected_shape() {
    let state = state();
    let (status, body) = send(&state, get("/api/hello").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    let json = json(&body);
    let greeting = json["greeting"].as_str().expect("greeting is string");
    assert!(
        greeting.starts_with("Hello from warden_core v"),
        "unexpected greeting: {greeting}"
    );
    assert_eq!(json["store_connected"], true);

    let (status, _) = send(&state, get("/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn wrong_client_tag_is_forbidden_and_bans_ip() {
    let state = state();
    let req = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .header("user-agent", "curl/8.0")
        .body(Body::from(r#"{"username":"x","password":"y"}"#))
        .unwrap();

    let (status, body) = send(&state, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.is_empty(), "deny must not carry detail");
    assert!(state.credentials().is_ip_banned("203.0.113.9").await.unwrap());

    // banned IPs don't reach public routes either
    let (status, _) = send(&state, get("/api/hello").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn register_then_me() {
    let state = state();
    let pair = register(&state, "alice").await;
    assert_eq!(pair["token_type"], "Bearer");
    assert_eq!(pair["expires_in"], 900);

    let access = pair["access_token"].as_str().unwrap();
    let req = get("/api/me")
        .header("user-agent", TAG)
        .header("authorization", format!("Bearer {access}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&state, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["username"], "alice");
}

#[tokio::test]
async fn refresh_token_cannot_reach_access_route() {
    let state = state();
    let pair = register(&state, "bob").await;
    let refresh = pair["refresh_token"].as_str().unwrap();

    let req = get("/api/me")
        .header("user-agent", TAG)
        .header("authorization", format!("Bearer {refresh}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&state, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn banned_user_token_is_forbidden() {
    let state = state();
    let pair = register(&state, "u2").await;
    let user = state
        .credentials()
        .find_user_by_username("u2")
        .await
        .unwrap()
        .unwrap();
    state.credentials().ban_user(&user.id).await.unwrap();

    let access = pair["access_token"].as_str().unwrap();
    let req = get("/api/me")
        .header("user-agent", TAG)
        .header("authorization", format!("Bearer {access}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&state, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn wrong_password_is_unauthorized() {
    let state = state();
    register(&state, "carol").await;
    let (status, body) = send(
        &state,
        post_json(
            "/auth/login",
            serde_json::json!({ "username": "carol", "password": "nope-nope" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json(&body)["error"], "unauthorized");
    assert!(!state.credentials().is_ip_banned("203.0.113.9").await.unwrap());
}

#[tokio::test]
async fn refresh_and_logout_flow() {
    let state = state();
    let pair = register(&state, "dave").await;
    let refresh = pair["refresh_token"].as_str().unwrap().to_string();

    let (status, body) = send(
        &state,
        post_json("/auth/refresh", serde_json::json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rotated = json(&body)["refresh_token"].as_str().unwrap().to_string();

    let (status, _) = send(
        &state,
        post_json("/auth/logout", serde_json::json!({ "refresh_token": rotated })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &state,
        post_json("/auth/refresh", serde_json::json!({ "refresh_token": rotated })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_path_is_json_not_found() {
    let state = state();
    let (status, body) = send(&state, get("/nope").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["error"], "not_found");

    state.credentials().ban_ip("203.0.113.9").await.unwrap();
    let (status, _) = send(&state, get("/nope").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn missing_peer_address_fails_closed() {
    let state = state();
    let resp = router(state.clone())
        .oneshot(get("/api/hello").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

//! Route registry.
//!
//! Each route pairs one or more paths and a method router with the gate
//! policy that guards it. The registry is ordered and built once at
//! startup, then handed to [`crate::router_with`].

use axum::routing::{MethodRouter, get, post};
use thiserror::Error;
use warden_core::gate::RoutePolicy;
use warden_core::models::auth::TokenKind;

use crate::AppState;
use crate::handlers::{auth, hello, me};

pub const GET_ROOT: &str = "/";
pub const GET_API_HELLO: &str = "/api/hello";
pub const POST_AUTH_REGISTER: &str = "/auth/register";
pub const POST_AUTH_LOGIN: &str = "/auth/login";
pub const POST_AUTH_REFRESH: &str = "/auth/refresh";
pub const POST_AUTH_LOGOUT: &str = "/auth/logout";
pub const GET_API_ME: &str = "/api/me";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route {0:?} is registered twice")]
    DuplicateName(&'static str),

    #[error("path {0:?} is already served by another route")]
    DuplicatePath(&'static str),

    #[error("route {0:?} has no paths")]
    NoPaths(&'static str),
}

/// One registered route.
pub struct RouteSpec {
    pub name: &'static str,
    pub paths: Vec<&'static str>,
    pub handler: MethodRouter<AppState>,
    pub policy: RoutePolicy,
}

impl RouteSpec {
    pub fn new(
        name: &'static str,
        paths: &[&'static str],
        handler: MethodRouter<AppState>,
        policy: RoutePolicy,
    ) -> Self {
        Self {
            name,
            paths: paths.to_vec(),
            handler,
            policy,
        }
    }
}

/// Ordered set of routes with unique names and paths.
#[derive(Default)]
pub struct RouteRegistry {
    routes: Vec<RouteSpec>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: RouteSpec) -> Result<(), RouteError> {
        if spec.paths.is_empty() {
            return Err(RouteError::NoPaths(spec.name));
        }
        if self.get(spec.name).is_some() {
            return Err(RouteError::DuplicateName(spec.name));
        }
        for path in &spec.paths {
            if self.routes.iter().any(|r| r.paths.contains(path)) {
                return Err(RouteError::DuplicatePath(*path));
            }
        }
        self.routes.push(spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RouteSpec> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl IntoIterator for RouteRegistry {
    type Item = RouteSpec;
    type IntoIter = std::vec::IntoIter<RouteSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.routes.into_iter()
    }
}

/// The built-in routes.
pub fn default_routes() -> RouteRegistry {
    let guarded = RoutePolicy::client().banning();
    RouteRegistry {
        routes: vec![
            RouteSpec::new(
                "hello",
                &[GET_ROOT, GET_API_HELLO],
                get(hello::hello_world),
                RoutePolicy::PUBLIC,
            ),
            RouteSpec::new(
                "register",
                &[POST_AUTH_REGISTER],
                post(auth::register_handler),
                guarded,
            ),
            RouteSpec::new("login", &[POST_AUTH_LOGIN], post(auth::login_handler), guarded),
            RouteSpec::new(
                "refresh",
                &[POST_AUTH_REFRESH],
                post(auth::refresh_handler),
                guarded,
            ),
            RouteSpec::new(
                "logout",
                &[POST_AUTH_LOGOUT],
                post(auth::logout_handler),
                RoutePolicy::client(),
            ),
            RouteSpec::new(
                "me",
                &[GET_API_ME],
                get(me::me_handler),
                guarded.with_token(TokenKind::Access),
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_routes_are_consistent() {
        let defaults = default_routes();
        let mut checked = RouteRegistry::new();
        for spec in defaults {
            checked.register(spec).unwrap();
        }
        assert_eq!(checked.len(), 6);
        assert_eq!(
            checked.get("me").unwrap().policy.require_token,
            Some(TokenKind::Access)
        );
        assert!(!checked.get("hello").unwrap().policy.require_client_tag);
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut registry = RouteRegistry::new();
        assert!(registry.is_empty());
        registry
            .register(RouteSpec::new("a", &["/a"], get(hello::hello_world), RoutePolicy::PUBLIC))
            .unwrap();
        assert_eq!(
            registry.register(RouteSpec::new(
                "a",
                &["/b"],
                get(hello::hello_world),
                RoutePolicy::PUBLIC
            )),
            Err(RouteError::DuplicateName("a"))
        );
        assert_eq!(
            registry.register(RouteSpec::new(
                "b",
                &["/a"],
                get(hello::hello_world),
                RoutePolicy::PUBLIC
            )),
            Err(RouteError::DuplicatePath("/a"))
        );
        assert_eq!(
            registry.register(RouteSpec::new("c", &[], get(hello::hello_world), RoutePolicy::PUBLIC)),
            Err(RouteError::NoPaths("c"))
        );
        assert_eq!(registry.len(), 1);
    }
}

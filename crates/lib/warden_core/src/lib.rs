//! # warden_core
//!
//! Core domain logic for Warden: token issuance and validation, the
//! credential and ban-list store, and the per-request access gate.

pub mod auth;
pub mod clock;
pub mod config;
pub mod gate;
pub mod hello;
pub mod migrate;
pub mod models;
pub mod store;
pub mod uuid;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

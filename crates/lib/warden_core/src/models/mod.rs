//! Domain models shared by the core, the API and the CLI.

pub mod auth;
pub mod ban;

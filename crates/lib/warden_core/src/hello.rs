//! Greeting served by the public landing route.

/// Returns a greeting string with the crate version.
pub fn hello_world() -> String {
    format!("Hello from warden_core v{}", super::version())
}

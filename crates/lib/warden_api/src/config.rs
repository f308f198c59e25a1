//! API server configuration.

use std::net::SocketAddr;

use warden_core::config::HttpConfig;

/// Configuration for the HTTP layer.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "0.0.0.0:2009").
    pub bind_addr: String,
    /// Lowercase header name carrying the client tag.
    pub client_tag_header: String,
    /// Lowercase header name carrying the hardware id.
    pub hwid_header: String,
    /// Use the first `X-Forwarded-For` entry as the source IP.
    pub trust_forwarded_for: bool,
}

impl ApiConfig {
    pub fn from_http(http: &HttpConfig) -> Self {
        Self {
            bind_addr: format!("{}:{}", http.address, http.port),
            client_tag_header: http.client_tag_header.to_ascii_lowercase(),
            hwid_header: http.hwid_header.to_ascii_lowercase(),
            trust_forwarded_for: http.trust_forwarded_for,
        }
    }

    /// Parse `bind_addr` for the listener.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.bind_addr.parse()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from_http(&HttpConfig::default())
    }
}

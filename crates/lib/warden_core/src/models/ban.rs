//! Ban-list models.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// What a ban record applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanTarget {
    User,
    Ip,
    Hwid,
}

impl fmt::Display for BanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BanTarget::User => "user",
            BanTarget::Ip => "IP",
            BanTarget::Hwid => "HWID",
        })
    }
}

/// Canonical form of an IP address used as a ban-list key.
///
/// Parsable addresses are rendered by `IpAddr`'s `Display`, so IPv6 comes
/// out lowercase and compressed and IPv4-mapped IPv6 collapses to IPv4.
/// Anything else is trimmed and lowercased.
pub fn normalize_ip(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(ip) => ip.to_string(),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}

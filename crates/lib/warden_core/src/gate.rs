//! Per-request access decision.
//!
//! Checks run in a fixed order and stop at the first failure:
//! client tag, bearer token, token owner, source IP, hardware id.
//! The IP check runs for every route, public ones included. Any failure,
//! store outages included, is a deny.

use tracing::{debug, info, warn};

use crate::auth::TokenError;
use crate::auth::jwt::TokenService;
use crate::models::auth::{TokenClaims, TokenKind};
use crate::store::{CredentialStore, StoreError};

/// Checks a route asks the gate to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutePolicy {
    pub require_client_tag: bool,
    pub require_token: Option<TokenKind>,
    /// Ban the source IP when any check fails.
    pub ban_on_fail: bool,
}

impl RoutePolicy {
    /// No identity checks. The IP ban check still applies.
    pub const PUBLIC: Self = Self {
        require_client_tag: false,
        require_token: None,
        ban_on_fail: false,
    };

    /// Requires the configured client tag.
    pub const fn client() -> Self {
        Self {
            require_client_tag: true,
            ..Self::PUBLIC
        }
    }

    pub const fn with_token(self, kind: TokenKind) -> Self {
        Self {
            require_token: Some(kind),
            ..self
        }
    }

    pub const fn banning(self) -> Self {
        Self {
            ban_on_fail: true,
            ..self
        }
    }
}

/// What the caller presented, as extracted by the HTTP layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdentity<'a> {
    pub client_tag: Option<&'a str>,
    /// Raw token, without the `Bearer ` scheme.
    pub bearer: Option<&'a str>,
    pub source_ip: Option<&'a str>,
    pub hwid: Option<&'a str>,
}

/// Which check failed. Logged, never sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    ClientTag,
    MissingToken,
    InvalidToken,
    UnknownUser,
    UserBanned,
    StaleToken,
    MissingSourceIp,
    IpBanned,
    HwidBanned,
    StoreUnavailable,
}

/// Outcome of [`AccessGate::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Carries the validated claims when the route required a token.
    Allow { claims: Option<TokenClaims> },
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

fn store_failure(e: StoreError) -> DenyReason {
    warn!(error = %e, "credential store failed during access check");
    DenyReason::StoreUnavailable
}

/// Ties the token service and the credential store into one decision.
#[derive(Clone)]
pub struct AccessGate {
    tokens: TokenService,
}

impl AccessGate {
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    fn credentials(&self) -> &CredentialStore {
        self.tokens.credentials()
    }

    /// Decide one request. On a deny with `ban_on_fail`, the source IP is
    /// banned before returning.
    pub async fn check(&self, policy: &RoutePolicy, identity: &RequestIdentity<'_>) -> Decision {
        match self.evaluate(policy, identity).await {
            Ok(claims) => Decision::Allow { claims },
            Err(reason) => {
                debug!(?reason, ip = ?identity.source_ip, "request denied");
                if policy.ban_on_fail && reason != DenyReason::IpBanned {
                    self.ban_source(identity.source_ip).await;
                }
                Decision::Deny(reason)
            }
        }
    }

    async fn evaluate(
        &self,
        policy: &RoutePolicy,
        identity: &RequestIdentity<'_>,
    ) -> Result<Option<TokenClaims>, DenyReason> {
        if policy.require_client_tag {
            let expected = self.tokens.settings().expected_client_tag.as_str();
            if identity.client_tag != Some(expected) {
                return Err(DenyReason::ClientTag);
            }
        }

        let claims = match policy.require_token {
            Some(kind) => Some(self.check_token(kind, identity.bearer).await?),
            None => None,
        };

        let ip = identity.source_ip.ok_or(DenyReason::MissingSourceIp)?;
        if self.credentials().is_ip_banned(ip).await.map_err(store_failure)? {
            return Err(DenyReason::IpBanned);
        }

        if let Some(hwid) = identity.hwid.filter(|h| !h.is_empty())
            && self
                .credentials()
                .is_hwid_banned(hwid)
                .await
                .map_err(store_failure)?
        {
            return Err(DenyReason::HwidBanned);
        }

        Ok(claims)
    }

    async fn check_token(
        &self,
        kind: TokenKind,
        bearer: Option<&str>,
    ) -> Result<TokenClaims, DenyReason> {
        let token = bearer.ok_or(DenyReason::MissingToken)?;
        let claims = self
            .tokens
            .validate_token(token, kind)
            .await
            .map_err(|e| match e {
                TokenError::Store(e) => store_failure(e),
                e => {
                    debug!(error = %e, "token rejected");
                    DenyReason::InvalidToken
                }
            })?;

        let user = self
            .credentials()
            .find_user(&claims.sub)
            .await
            .map_err(store_failure)?
            .ok_or(DenyReason::UnknownUser)?;
        if user.banned {
            return Err(DenyReason::UserBanned);
        }
        if user.token_generation != claims.ver {
            return Err(DenyReason::StaleToken);
        }
        Ok(claims)
    }

    async fn ban_source(&self, ip: Option<&str>) {
        let Some(ip) = ip else {
            return;
        };
        match self.credentials().ban_ip(ip).await {
            Ok(()) => info!(ip, "banned source IP after failed access check"),
            Err(StoreError::AlreadyBanned(_)) => {}
            Err(e) => warn!(ip, error = %e, "failed to ban source IP"),
        }
    }
}

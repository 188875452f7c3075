//! Abuse-tracking identifier resolution.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::request::RequestMeta;

/// What an identifier was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentifierKind {
    Ip,
    UserId,
}

/// Stable key for an actor: `user:<id>` when authenticated, else `ip:<addr>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    value: String,
    kind: IdentifierKind,
}

impl Identifier {
    /// Identifier for a verified user id.
    pub fn user(id: &str) -> Self {
        Self {
            value: format!("user:{}", id),
            kind: IdentifierKind::UserId,
        }
    }

    /// Identifier for a client network address.
    pub fn ip(addr: &str) -> Self {
        Self {
            value: format!("ip:{}", addr),
            kind: IdentifierKind::Ip,
        }
    }

    /// The namespaced key, e.g. `ip:203.0.113.5`.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn kind(&self) -> IdentifierKind {
        self.kind
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// How much to trust forwarding headers set by reverse proxies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyTrust {
    /// Only the connected peer address counts.
    #[default]
    None,
    /// The leftmost `X-Forwarded-For` entry is the client.
    ForwardedFor,
}

/// Resolves the client address and the abuse-tracking identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierResolver {
    trust: ProxyTrust,
}

impl IdentifierResolver {
    /// Create a new resolver with the given proxy trust.
    pub fn new(trust: ProxyTrust) -> Self {
        Self { trust }
    }

    /// The real client address, looking through trusted proxies.
    pub fn client_addr(&self, request: &RequestMeta) -> Option<IpAddr> {
        if self.trust == ProxyTrust::ForwardedFor {
            let forwarded = request
                .forwarded_for
                .as_deref()
                .and_then(|chain| chain.split(',').next())
                .and_then(|first| first.trim().parse().ok());
            if forwarded.is_some() {
                return forwarded;
            }
        }
        request.peer_addr
    }

    /// Derive the identifier for a request.
    ///
    /// Returns `None` for an anonymous request with no usable address.
    /// Such callers are never folded into a shared placeholder key.
    pub fn resolve(&self, request: &RequestMeta) -> Option<Identifier> {
        if let Some(user_id) = request.user_id.as_deref() {
            return Some(Identifier::user(user_id));
        }
        self.client_addr(request)
            .map(|addr| Identifier::ip(&addr.to_string()))
    }
}

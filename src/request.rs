//! Transport-neutral view of an inbound HTTP request.
//!
//! The gate, the resolvers and the pattern detector only need a handful of
//! request attributes. Extracting them once keeps those components pure and
//! easy to test without building full HTTP requests.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{header, Request};

/// Identity attached to a request by an upstream authentication layer.
///
/// Authentication is outside this crate; any middleware that verifies a
/// caller inserts this extension and the gate picks it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// The request attributes consulted when rate limiting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// HTTP method
    pub method: String,
    /// Request path without the query string
    pub path: String,
    /// Declared `Content-Length`, if any
    pub content_length: Option<u64>,
    /// `User-Agent` header, if any
    pub user_agent: Option<String>,
    /// Raw `X-Forwarded-For` header, if any
    pub forwarded_for: Option<String>,
    /// Address of the directly connected peer
    pub peer_addr: Option<IpAddr>,
    /// Verified user id from [`AuthenticatedUser`]
    pub user_id: Option<String>,
}

impl RequestMeta {
    /// Create a bare request view for the given method and path.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Extract the rate limiting view from an HTTP request.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let headers = request.headers();
        let header_str = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            method: request.method().as_str().to_string(),
            path: request.uri().path().to_string(),
            content_length: header_str(header::CONTENT_LENGTH)
                .and_then(|v| v.trim().parse().ok()),
            user_agent: header_str(header::USER_AGENT),
            forwarded_for: headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            peer_addr: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip()),
            user_id: request
                .extensions()
                .get::<AuthenticatedUser>()
                .map(|user| user.0.clone()),
        }
    }

    pub fn with_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }

    /// Whether the request carries a verified identity.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

//! Pluggable authentication over the WebSocket upgrade request.
//!
//! The relay itself enforces nothing; deployments hand in a strategy at
//! startup. The default admits everyone.

use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Predicate over the upgrade request, evaluated before the handshake
/// completes. Returning `false` rejects the connection with 401.
pub trait AuthStrategy: Send + Sync {
    fn authorize(&self, request: &Request) -> bool;
}

/// Default strategy: allow all.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthStrategy for AllowAll {
    fn authorize(&self, _request: &Request) -> bool {
        true
    }
}

/// Bearer-token strategy: the `Authorization` header must carry the exact
/// configured token.
#[derive(Debug, Clone)]
pub struct BearerToken {
    expected: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            expected: format!("Bearer {}", token.into()),
        }
    }
}

impl AuthStrategy for BearerToken {
    fn authorize(&self, request: &Request) -> bool {
        request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(|value| value == self.expected)
            .unwrap_or(false)
    }
}

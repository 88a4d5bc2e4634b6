//! Session credentials for the REST client and the live connection.
//!
//! Deployments authenticate either with an explicit bearer token in the
//! CONNECT frame and `Authorization` header, or implicitly with session
//! cookies. Both variants implement one [`CredentialProvider`] trait so
//! the connection manager has a single code path; the provider is
//! consulted again on every connect, so a refreshed token is picked up
//! without rebuilding the manager.

/// Source of the session credential, injected into [`crate::RestClient`]
/// and [`crate::WsConnector`].
pub trait CredentialProvider: Send + Sync {
    /// Bearer credential, if this deployment uses one.
    fn bearer(&self) -> Option<String> {
        None
    }

    /// Value of the `Cookie` header to attach to HTTP and upgrade
    /// requests, if the session rides on cookies.
    fn cookie(&self) -> Option<String> {
        None
    }
}

/// Token-based deployments. The token is read from the source at every
/// request/connect rather than captured once.
pub struct BearerAuth {
    source: Box<dyn Fn() -> Option<String> + Send + Sync>,
}

impl BearerAuth {
    /// Fixed token, e.g. read from configuration at startup.
    pub fn from_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            source: Box::new(move || Some(token.clone())),
        }
    }

    /// Dynamic token source, e.g. a session store that rotates the JWT.
    pub fn from_source(source: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }
}

impl CredentialProvider for BearerAuth {
    fn bearer(&self) -> Option<String> {
        (self.source)()
    }
}

/// Cookie-session deployments. With no explicit header the REST client
/// relies on its own cookie jar; the WebSocket upgrade request gets the
/// header when one is supplied.
#[derive(Default)]
pub struct CookieAuth {
    header: Option<String>,
}

impl CookieAuth {
    /// Session carried entirely by the HTTP stack's cookie jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit `Cookie` header value, e.g. `SESSION=abc123`.
    pub fn with_header(header: impl Into<String>) -> Self {
        Self {
            header: Some(header.into()),
        }
    }
}

impl CredentialProvider for CookieAuth {
    fn cookie(&self) -> Option<String> {
        self.header.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_source_is_reread() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let auth = BearerAuth::from_source(move || {
            Some(format!("jwt-{}", c.fetch_add(1, Ordering::SeqCst)))
        });

        assert_eq!(auth.bearer().as_deref(), Some("jwt-0"));
        assert_eq!(auth.bearer().as_deref(), Some("jwt-1"));
    }

    #[test]
    fn cookie_variant_has_no_bearer() {
        let auth = CookieAuth::with_header("SESSION=abc");
        assert_eq!(auth.bearer(), None);
        assert_eq!(auth.cookie().as_deref(), Some("SESSION=abc"));
    }
}

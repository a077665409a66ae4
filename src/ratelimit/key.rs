//! Mapping request-like values to rate limit keys.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Key used when a request carries no usable identity.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// The parts of an incoming request a key generator may look at.
///
/// HTTP adapters implement this for their framework's request type.
pub trait ClientRequest: Send + Sync {
    /// Network address of the calling client, if known.
    fn client_addr(&self) -> Option<IpAddr>;

    /// Value of a request header, if the request type carries headers.
    fn header(&self, _name: &str) -> Option<&str> {
        None
    }
}

impl ClientRequest for IpAddr {
    fn client_addr(&self) -> Option<IpAddr> {
        Some(*self)
    }
}

impl ClientRequest for SocketAddr {
    fn client_addr(&self) -> Option<IpAddr> {
        Some(self.ip())
    }
}

type KeyFn = dyn Fn(&dyn ClientRequest) -> String + Send + Sync;

/// Derives the rate limit key for a request.
///
/// The default keys requests by client address.
#[derive(Clone)]
pub struct KeyGenerator {
    inner: Arc<KeyFn>,
}

impl KeyGenerator {
    /// Wrap an arbitrary key function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&dyn ClientRequest) -> String + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Key by client address, or [`UNKNOWN_CLIENT`] when there is none.
    pub fn client_addr() -> Self {
        Self::from_fn(client_addr_key)
    }

    /// Key by a request header, falling back to the client address.
    pub fn header(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::from_fn(move |request| match request.header(&name) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => client_addr_key(request),
        })
    }

    pub fn generate(&self, request: &dyn ClientRequest) -> String {
        (self.inner)(request)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::client_addr()
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGenerator").finish_non_exhaustive()
    }
}

fn client_addr_key(request: &dyn ClientRequest) -> String {
    request
        .client_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

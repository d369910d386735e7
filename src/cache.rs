//! Idle socket cache for keep-alive reuse.
//!
//! Caller-owned and opt-in: the caller constructs the cache, hands the
//! driver a shared handle through [`Config`](crate::Config), and keeps
//! responsibility for eviction and size limits. The driver inserts only
//! on clean keep-alive HTTP/1.1 completion and removes on reuse or
//! [`SocketCache::purge`]. Sockets are never cached after any recorded
//! error, on HTTP/1.0, or when the response carried `Connection: close`.

use std::collections::HashMap;

use mio::net::TcpStream;

use crate::target::{Scheme, Target};
#[cfg(feature = "tls")]
use crate::tls::TlsSession;

/// Key identifying a reusable idle socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pid: u32,
    host: String,
    port: u16,
    scheme: Scheme,
}

impl CacheKey {
    pub(crate) fn for_target(target: &Target) -> Self {
        CacheKey {
            pid: std::process::id(),
            host: target.host.clone(),
            port: target.port,
            scheme: target.scheme,
        }
    }

    fn for_endpoint(host: &str, port: u16, scheme: Scheme) -> Self {
        CacheKey {
            pid: std::process::id(),
            host: host.to_string(),
            port,
            scheme,
        }
    }
}

/// An idle keep-alive socket, with its TLS session when https.
pub struct CachedSocket {
    pub(crate) sock: TcpStream,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<TlsSession>,
}

/// Caller-owned idle socket pool keyed by `(process-id, host, port,
/// scheme)`. Unbounded by the driver.
#[derive(Default)]
pub struct SocketCache {
    sockets: HashMap<CacheKey, CachedSocket>,
}

impl SocketCache {
    pub fn new() -> Self {
        SocketCache {
            sockets: HashMap::new(),
        }
    }

    pub(crate) fn take(&mut self, key: &CacheKey) -> Option<CachedSocket> {
        self.sockets.remove(key)
    }

    pub(crate) fn insert(&mut self, key: CacheKey, cached: CachedSocket) {
        self.sockets.insert(key, cached);
    }

    /// Whether an idle socket is cached for the endpoint.
    pub fn contains(&self, host: &str, port: u16, scheme: Scheme) -> bool {
        self.sockets
            .contains_key(&CacheKey::for_endpoint(host, port, scheme))
    }

    /// Drop the cached socket for the endpoint, closing it.
    pub fn purge(&mut self, host: &str, port: u16, scheme: Scheme) {
        self.sockets
            .remove(&CacheKey::for_endpoint(host, port, scheme));
    }

    /// Drop every cached socket.
    pub fn clear(&mut self) {
        self.sockets.clear();
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

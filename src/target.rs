//! Host specification and per-attempt target selection.
//!
//! A request names its destination as a single endpoint, an ordered pool
//! cycled round-robin across attempts, or a callable choosing per attempt.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::rc::Rc;

/// URL scheme understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Well-known port for the scheme.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved destination for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host as named by the caller (DNS name or IP literal).
    pub host: String,
    /// Resolved address. `None` until DNS resolution runs.
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub scheme: Scheme,
}

impl Target {
    /// Socket address for the attempt, once the host is resolved.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolve the host through the system resolver, keeping the first
    /// address. No-op when the host was an IP literal.
    pub(crate) fn resolve(&mut self) -> io::Result<()> {
        if self.ip.is_some() {
            return Ok(());
        }
        let mut addrs = (self.host.as_str(), self.port).to_socket_addrs()?;
        match addrs.next() {
            Some(addr) => {
                self.ip = Some(addr.ip());
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for host {}", self.host),
            )),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Result of a [`HostSpec::Pick`] callable: either an endpoint string to
/// parse, or a fully specified target.
pub enum HostPick {
    Endpoint(String),
    Target(Target),
}

/// Destination specification for a request.
#[derive(Clone)]
pub enum HostSpec {
    /// A single `"host[:port]"` or `"ip[:port]"` endpoint.
    One(String),
    /// An ordered endpoint pool, cycled round-robin by attempt index.
    Pool(Vec<String>),
    /// A callable invoked once per attempt with the attempt index.
    Pick(Rc<dyn Fn(u32) -> HostPick>),
}

impl HostSpec {
    /// Choose the target for the given attempt.
    ///
    /// `port` is the request-level port override; the port embedded in an
    /// endpoint string wins over it, and the scheme default applies last.
    pub(crate) fn select(
        &self,
        attempt: u32,
        port: Option<u16>,
        scheme: Scheme,
    ) -> Result<Target, String> {
        match self {
            HostSpec::One(endpoint) => endpoint_target(endpoint, port, scheme),
            HostSpec::Pool(endpoints) => {
                if endpoints.is_empty() {
                    return Err("empty host pool".to_string());
                }
                let endpoint = &endpoints[attempt as usize % endpoints.len()];
                endpoint_target(endpoint, port, scheme)
            }
            HostSpec::Pick(pick) => match pick(attempt) {
                HostPick::Endpoint(endpoint) => endpoint_target(&endpoint, port, scheme),
                HostPick::Target(target) => Ok(target),
            },
        }
    }
}

impl fmt::Debug for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostSpec::One(s) => f.debug_tuple("One").field(s).finish(),
            HostSpec::Pool(v) => f.debug_tuple("Pool").field(v).finish(),
            HostSpec::Pick(_) => f.write_str("Pick(..)"),
        }
    }
}

impl From<&str> for HostSpec {
    fn from(s: &str) -> Self {
        HostSpec::One(s.to_string())
    }
}

impl From<String> for HostSpec {
    fn from(s: String) -> Self {
        HostSpec::One(s)
    }
}

impl From<Vec<String>> for HostSpec {
    fn from(v: Vec<String>) -> Self {
        HostSpec::Pool(v)
    }
}

impl From<Vec<&str>> for HostSpec {
    fn from(v: Vec<&str>) -> Self {
        HostSpec::Pool(v.into_iter().map(str::to_string).collect())
    }
}

fn endpoint_target(endpoint: &str, port: Option<u16>, scheme: Scheme) -> Result<Target, String> {
    let (host, explicit_port) = split_endpoint(endpoint)?;
    if host.is_empty() {
        return Err(format!("empty host in endpoint {endpoint:?}"));
    }
    let ip = host.parse::<IpAddr>().ok();
    Ok(Target {
        host: host.to_string(),
        ip,
        port: explicit_port.or(port).unwrap_or(scheme.default_port()),
        scheme,
    })
}

/// Split `"host[:port]"`, handling bracketed IPv6 literals.
fn split_endpoint(endpoint: &str) -> Result<(&str, Option<u16>), String> {
    if let Some(rest) = endpoint.strip_prefix('[') {
        let Some((host, after)) = rest.split_once(']') else {
            return Err(format!("unterminated bracket in endpoint {endpoint:?}"));
        };
        match after.strip_prefix(':') {
            Some(p) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| format!("bad port in endpoint {endpoint:?}"))?;
                Ok((host, Some(port)))
            }
            None if after.is_empty() => Ok((host, None)),
            None => Err(format!("trailing garbage in endpoint {endpoint:?}")),
        }
    } else {
        match endpoint.rsplit_once(':') {
            // A second colon means a raw IPv6 literal with no port.
            Some((host, p)) if !host.contains(':') => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| format!("bad port in endpoint {endpoint:?}"))?;
                Ok((host, Some(port)))
            }
            _ => Ok((endpoint, None)),
        }
    }
}

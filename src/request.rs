//! Request record and wire serialization.

use std::time::Duration;

use bytes::Bytes;

use crate::error::Error;
use crate::hooks::{Hooks, TerminalFn};
use crate::target::{HostSpec, Scheme};

/// A single HTTP request: wire fields plus per-attempt policy.
///
/// Immutable for the duration of an attempt; `reinit` from a terminal
/// callback may rewrite fields between attempts.
pub struct Request {
    pub(crate) host: HostSpec,
    pub(crate) port: Option<u16>,
    pub(crate) scheme: Scheme,
    pub(crate) protocol: String,
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query_string: Option<String>,
    pub(crate) head: Vec<(String, String)>,
    pub(crate) body: Bytes,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) drain_timeout: Option<Duration>,
    pub(crate) retries: u32,
    pub(crate) hooks: Hooks,
    pub(crate) callback: Option<TerminalFn>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("protocol", &self.protocol)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query_string", &self.query_string)
            .field("head", &self.head)
            .field("body", &self.body)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Headers in submitted order; duplicates are preserved.
    pub fn head(&self) -> &[(String, String)] {
        &self.head
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Serialize the request line, headers, and body exactly as
    /// submitted. No normalization, no escaping.
    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        if let Some(q) = &self.query_string {
            out.push(b'?');
            out.extend_from_slice(q.as_bytes());
        }
        out.push(b' ');
        out.extend_from_slice(self.protocol.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.head {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Per-request options. Unset fields inherit the client defaults.
#[derive(Clone, Default)]
pub struct RequestOpts {
    pub host: Option<HostSpec>,
    pub port: Option<u16>,
    pub scheme: Option<Scheme>,
    pub protocol: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub query_string: Option<String>,
    pub head: Option<Vec<(String, String)>>,
    pub body: Option<Bytes>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub drain_timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub hooks: Hooks,
    pub callback: Option<TerminalFn>,
}

impl RequestOpts {
    /// Build a concrete request, filling unset fields from `defaults`.
    pub(crate) fn build(self, defaults: &RequestOpts) -> Result<Request, Error> {
        let host = self
            .host
            .or_else(|| defaults.host.clone())
            .ok_or(Error::NoHost)?;
        Ok(Request {
            host,
            port: self.port.or(defaults.port),
            scheme: self.scheme.or(defaults.scheme).unwrap_or(Scheme::Http),
            protocol: self
                .protocol
                .or_else(|| defaults.protocol.clone())
                .unwrap_or_else(|| "HTTP/1.1".to_string()),
            method: self
                .method
                .or_else(|| defaults.method.clone())
                .unwrap_or_else(|| "GET".to_string()),
            path: self
                .path
                .or_else(|| defaults.path.clone())
                .unwrap_or_else(|| "/".to_string()),
            query_string: self.query_string.or_else(|| defaults.query_string.clone()),
            head: self
                .head
                .or_else(|| defaults.head.clone())
                .unwrap_or_default(),
            body: self
                .body
                .or_else(|| defaults.body.clone())
                .unwrap_or_default(),
            connect_timeout: self.connect_timeout.or(defaults.connect_timeout),
            request_timeout: self.request_timeout.or(defaults.request_timeout),
            drain_timeout: self.drain_timeout.or(defaults.drain_timeout),
            retries: self.retries.or(defaults.retries).unwrap_or(0),
            hooks: self.hooks.or_defaults(&defaults.hooks),
            callback: self.callback.or_else(|| defaults.callback.clone()),
        })
    }

    /// Apply set fields onto an existing request (reinit overrides).
    pub(crate) fn apply_to(self, req: &mut Request) {
        if let Some(host) = self.host {
            req.host = host;
        }
        if let Some(port) = self.port {
            req.port = Some(port);
        }
        if let Some(scheme) = self.scheme {
            req.scheme = scheme;
        }
        if let Some(protocol) = self.protocol {
            req.protocol = protocol;
        }
        if let Some(method) = self.method {
            req.method = method;
        }
        if let Some(path) = self.path {
            req.path = path;
        }
        if let Some(query_string) = self.query_string {
            req.query_string = Some(query_string);
        }
        if let Some(head) = self.head {
            req.head = head;
        }
        if let Some(body) = self.body {
            req.body = body;
        }
        if let Some(t) = self.connect_timeout {
            req.connect_timeout = Some(t);
        }
        if let Some(t) = self.request_timeout {
            req.request_timeout = Some(t);
        }
        if let Some(t) = self.drain_timeout {
            req.drain_timeout = Some(t);
        }
        if let Some(retries) = self.retries {
            req.retries = retries;
        }
        if let Some(h) = self.hooks.init {
            req.hooks.init = Some(h);
        }
        if let Some(h) = self.hooks.connecting {
            req.hooks.connecting = Some(h);
        }
        if let Some(h) = self.hooks.connected {
            req.hooks.connected = Some(h);
        }
        if let Some(h) = self.hooks.writing {
            req.hooks.writing = Some(h);
        }
        if let Some(h) = self.hooks.reading {
            req.hooks.reading = Some(h);
        }
        if let Some(cb) = self.callback {
            req.callback = Some(cb);
        }
    }
}

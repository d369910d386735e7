//! Per-connection state tracked by the driver.

use std::time::Instant;

use mio::Interest;
use mio::net::TcpStream;

use crate::error::ErrorKind;
use crate::request::Request;
use crate::response::{Response, ResponseParser};
use crate::target::Target;
use crate::timer::TimerId;
#[cfg(feature = "tls")]
use crate::tls::TlsSession;

/// Stable connection identifier, monotonically assigned and never reused
/// for the lifetime of the client.
pub type ConnId = u64;

/// Lifecycle states, in state-graph order. The derived ordering follows
/// the happy path, so "reached" comparisons work for
/// [`Client::run_until`](crate::Client::run_until).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnState {
    Initialized,
    ResolveDns,
    Connecting,
    Connected,
    TlsHandshake,
    Writing,
    Reading,
    UserAction,
    Completed,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Initialized => "initialized",
            ConnState::ResolveDns => "resolve_dns",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::TlsHandshake => "tls_handshake",
            ConnState::Writing => "writing",
            ConnState::Reading => "reading",
            ConnState::UserAction => "user_action",
            ConnState::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a connection's error timeline.
#[derive(Debug, Clone)]
pub struct ConnError {
    pub kind: ErrorKind,
    pub message: String,
    /// Target of the attempt the error occurred on, if one was selected.
    pub target: Option<Target>,
    pub at: Instant,
}

/// A single request's lifecycle: identity, request, current state,
/// attempt bookkeeping, I/O resources, and the error timeline.
pub struct Connection {
    pub(crate) id: ConnId,
    pub(crate) state: ConnState,
    pub(crate) request: Request,
    pub(crate) target: Option<Target>,
    pub(crate) attempts_left: u32,
    /// Attempts started so far; drives the host pool cursor.
    pub(crate) attempt: u32,
    pub(crate) response: Option<Response>,
    pub(crate) parser: Option<ResponseParser>,
    pub(crate) errors: Vec<ConnError>,
    pub(crate) timeline: Vec<(ConnState, Instant)>,
    pub(crate) keep_timeline: bool,
    pub(crate) sock: Option<TcpStream>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<TlsSession>,
    pub(crate) write_buf: Vec<u8>,
    pub(crate) write_pos: usize,
    /// Readiness interest currently registered with the poller.
    pub(crate) interest: Option<Interest>,
    pub(crate) connect_timer: Option<TimerId>,
    pub(crate) drain_timer: Option<TimerId>,
    pub(crate) request_timer: Option<TimerId>,
    /// Absolute end-to-end deadline, fixed at submission; spans retries.
    pub(crate) request_deadline: Option<Instant>,
    /// Guards the at-most-once user-action phase per attempt chain.
    pub(crate) user_action_entered: bool,
    /// Whether the current attempt took its socket from the cache.
    pub(crate) reused_socket: bool,
}

impl Connection {
    pub(crate) fn new(id: ConnId, request: Request, keep_timeline: bool) -> Self {
        let attempts_left = request.retries.saturating_add(1);
        let request_deadline = request.request_timeout.map(|t| Instant::now() + t);
        Connection {
            id,
            state: ConnState::Initialized,
            request,
            target: None,
            attempts_left,
            attempt: 0,
            response: None,
            parser: None,
            errors: Vec::new(),
            timeline: Vec::new(),
            keep_timeline,
            sock: None,
            #[cfg(feature = "tls")]
            tls: None,
            write_buf: Vec::new(),
            write_pos: 0,
            interest: None,
            connect_timer: None,
            drain_timer: None,
            request_timer: None,
            request_deadline,
            user_action_entered: false,
            reused_socket: false,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Target of the current (or last) attempt.
    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// URL of the current attempt, once a target is selected.
    pub fn url(&self) -> Option<String> {
        let t = self.target.as_ref()?;
        let mut url = format!("{}://{}:{}{}", t.scheme, t.host, t.port, self.request.path);
        if let Some(q) = &self.request.query_string {
            url.push('?');
            url.push_str(q);
        }
        Some(url)
    }

    /// Append-only error timeline; persists across retries.
    pub fn errors(&self) -> &[ConnError] {
        &self.errors
    }

    pub fn last_error(&self) -> Option<&ConnError> {
        self.errors.last()
    }

    /// State transition timeline, populated when the client was
    /// configured with `keep_timeline`.
    pub fn timeline(&self) -> &[(ConnState, Instant)] {
        &self.timeline
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The parsed response. Populated only when the terminal error kind
    /// is [`ErrorKind::NoError`](crate::ErrorKind::NoError).
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }

    /// Whether the current attempt took its socket from the cache.
    pub fn reused_socket(&self) -> bool {
        self.reused_socket
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        self.state = state;
        if self.keep_timeline {
            self.timeline.push((state, Instant::now()));
        }
    }

    pub(crate) fn push_error(&mut self, kind: ErrorKind, message: String) {
        self.errors.push(ConnError {
            kind,
            message,
            target: self.target.clone(),
            at: Instant::now(),
        });
    }

    /// Clear per-attempt I/O state. The socket and timers must already be
    /// released by the driver; errors and timeline are kept.
    pub(crate) fn clear_attempt(&mut self) {
        debug_assert!(self.sock.is_none());
        self.write_buf.clear();
        self.write_pos = 0;
        self.parser = None;
        self.response = None;
        self.reused_socket = false;
        #[cfg(feature = "tls")]
        {
            self.tls = None;
        }
    }
}

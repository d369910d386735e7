//! Connection state machine driver.
//!
//! `Client` owns the poller, the deadline table, and every connection,
//! and advances each connection through resolve, connect, TLS handshake,
//! write, read, and user-callback phases. All work is single-threaded;
//! suspension points are readiness waits and deadline expirations.
//!
//! Reentrancy: the terminal callback runs while the driver holds the
//! connection, so every action it requests (retry, reinit, drop, break,
//! new submissions) is recorded on the dispatch context and enacted
//! after the callback returns. Mutations of other connections take
//! effect on the next loop iteration.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::cache::{CacheKey, CachedSocket};
use crate::config::Config;
use crate::connection::{ConnId, ConnState, Connection};
use crate::error::{Error, ErrorKind};
use crate::hooks::StateHook;
use crate::metrics;
use crate::poller::Poller;
use crate::request::RequestOpts;
use crate::response::{Response, ResponseParser};
use crate::target::Scheme;
use crate::timer::{TimerKind, TimerTable};

const READ_CHUNK: usize = 16 * 1024;

/// Action requested by the terminal callback for its own connection.
#[derive(Default)]
enum Decision {
    #[default]
    Proceed,
    Retry,
    Reinit(Box<RequestOpts>),
    Drop,
}

enum HookOutcome {
    Ran,
    Failed(String),
    Panicked,
}

/// Dispatch context handed to the terminal callback.
///
/// Exposes the completed (or failed) connection and the driver
/// operations a callback may invoke. Actions on the current connection
/// are deferred until the callback returns; submissions and drops of
/// other connections apply on the next loop iteration.
pub struct UserCtx<'a> {
    conn: &'a Connection,
    kind: ErrorKind,
    message: &'a str,
    decision: &'a mut Decision,
    staged: &'a mut Vec<Connection>,
    staged_drops: &'a mut Vec<ConnId>,
    breaking: &'a mut bool,
    next_id: &'a mut ConnId,
    defaults: &'a RequestOpts,
    keep_timeline: bool,
}

impl UserCtx<'_> {
    pub fn conn(&self) -> &Connection {
        self.conn
    }

    /// Terminal error kind. [`ErrorKind::NoError`] means the response is
    /// populated; for any other kind the response must not be read.
    pub fn error_kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn error_message(&self) -> &str {
        self.message
    }

    pub fn response(&self) -> Option<&Response> {
        self.conn.response()
    }

    /// Request another attempt. Silent no-op when no attempts remain.
    /// Consumes one attempt.
    pub fn retry(&mut self) {
        if self.conn.attempts_left > 0 {
            *self.decision = Decision::Retry;
        }
    }

    /// Reinitialize the connection: apply `overrides` to the request and
    /// reset the attempt budget to the (possibly overridden) retries.
    pub fn reinit(&mut self, overrides: RequestOpts) {
        *self.decision = Decision::Reinit(Box::new(overrides));
    }

    /// Complete the connection without further callback invocations.
    pub fn discard(&mut self) {
        *self.decision = Decision::Drop;
    }

    /// Drop a connection by id. Dropping the current connection is
    /// equivalent to [`UserCtx::discard`]; other connections are removed
    /// on the next loop iteration.
    pub fn drop_conn(&mut self, id: ConnId) {
        if id == self.conn.id {
            *self.decision = Decision::Drop;
        } else {
            self.staged_drops.push(id);
        }
    }

    /// Stop the running loop at the next safe point.
    pub fn break_loop(&mut self) {
        *self.breaking = true;
    }

    /// Submit a new request. Work begins on the next loop iteration.
    pub fn submit(&mut self, opts: RequestOpts) -> Result<ConnId, Error> {
        let request = opts.build(self.defaults)?;
        let id = *self.next_id;
        *self.next_id += 1;
        metrics::REQUESTS_SUBMITTED.increment();
        self.staged
            .push(Connection::new(id, request, self.keep_timeline));
        Ok(id)
    }
}

/// The event-driven HTTP client.
///
/// Submit requests with [`Client::request`], then drive them with the
/// `run` family. Each connection advances through an explicit state
/// machine with per-state hooks, three deadlines, and a retry budget.
pub struct Client {
    config: Config,
    poller: Poller,
    timers: TimerTable,
    conns: HashMap<ConnId, Connection>,
    next_id: ConnId,
    running: bool,
    breaking: bool,
    staged: Vec<Connection>,
    staged_drops: Vec<ConnId>,
}

impl Client {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let poller = Poller::new(config.event_capacity)?;
        Ok(Client {
            config,
            poller,
            timers: TimerTable::new(),
            conns: HashMap::new(),
            next_id: 0,
            running: false,
            breaking: false,
            staged: Vec::new(),
            staged_drops: Vec::new(),
        })
    }

    /// Submit a request. Options override the configured defaults field
    /// by field. Returns immediately; I/O begins on the next loop
    /// iteration.
    pub fn request(&mut self, opts: RequestOpts) -> Result<ConnId, Error> {
        let request = opts.build(&self.config.defaults)?;
        #[cfg(feature = "tls")]
        if request.scheme() == Scheme::Https && self.config.tls_client.is_none() {
            return Err(Error::TlsNotConfigured);
        }
        #[cfg(not(feature = "tls"))]
        if request.scheme() == Scheme::Https {
            return Err(Error::TlsNotConfigured);
        }
        let id = self.next_id;
        self.next_id += 1;
        metrics::REQUESTS_SUBMITTED.increment();
        let conn = Connection::new(id, request, self.config.keep_timeline);
        self.absorb(conn);
        Ok(id)
    }

    /// Remove a connection: cancel its watchers and timers, close its
    /// socket (never cached), and skip the terminal callback.
    pub fn drop_conn(&mut self, id: ConnId) {
        let Some(mut conn) = self.conns.remove(&id) else {
            return;
        };
        self.cancel_all_timers(&mut conn);
        if let Some(mut sock) = conn.sock.take()
            && conn.interest.is_some()
        {
            let _ = self.poller.deregister(&mut sock);
        }
        if conn.state != ConnState::Completed {
            metrics::CONNECTIONS_ACTIVE.decrement();
        }
    }

    /// Drive the loop until every connection has completed.
    pub fn run(&mut self) -> Result<(), Error> {
        self.run_loop(None, &[])
    }

    /// Drive the loop until every listed connection has reached `state`
    /// (or beyond). With an empty list, until every connection has.
    pub fn run_until(&mut self, state: ConnState, ids: &[ConnId]) -> Result<(), Error> {
        self.run_loop(Some(state), ids)
    }

    /// One blocking loop iteration.
    pub fn run_once(&mut self) -> Result<(), Error> {
        self.running = true;
        self.breaking = false;
        let result = self.turn(true);
        self.running = false;
        result
    }

    /// One non-blocking loop iteration.
    pub fn run_nowait(&mut self) -> Result<(), Error> {
        self.running = true;
        self.breaking = false;
        let result = self.turn(false);
        self.running = false;
        result
    }

    /// Cancel the current `run` at the next safe point. Connection state
    /// is left untouched; a later `run` resumes where things stood.
    pub fn break_loop(&mut self) {
        self.breaking = true;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Look up a connection for inspection.
    pub fn conn(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    // ── Loop machinery ─────────────────────────────────────────────

    fn run_loop(&mut self, until: Option<ConnState>, ids: &[ConnId]) -> Result<(), Error> {
        self.running = true;
        self.breaking = false;
        let mut result = Ok(());
        loop {
            if self.goal_reached(until, ids) {
                break;
            }
            if let Err(e) = self.turn(true) {
                result = Err(e);
                break;
            }
            if self.breaking {
                break;
            }
        }
        self.running = false;
        result
    }

    fn goal_reached(&self, until: Option<ConnState>, ids: &[ConnId]) -> bool {
        if !self.staged.is_empty() {
            return false;
        }
        match until {
            None => self.conns.values().all(|c| c.state == ConnState::Completed),
            Some(state) => {
                if ids.is_empty() {
                    self.conns.values().all(|c| c.state >= state)
                } else {
                    ids.iter()
                        .all(|id| self.conns.get(id).is_none_or(|c| c.state >= state))
                }
            }
        }
    }

    fn turn(&mut self, block: bool) -> Result<(), Error> {
        self.flush_staged();
        self.kick_initialized();

        let timeout = self.poll_timeout(block);
        self.poller.poll(timeout)?;

        for ev in self.poller.ready() {
            self.dispatch_io(ev.token.0 as ConnId, ev.readable, ev.writable);
        }

        let fired = self.timers.expire(Instant::now());
        for (id, kind) in fired {
            self.dispatch_timer(id, kind);
        }

        self.flush_staged();
        Ok(())
    }

    fn poll_timeout(&mut self, block: bool) -> Option<Duration> {
        if !block {
            return Some(Duration::ZERO);
        }
        // Attempts pending a start must not be slept on.
        if self
            .conns
            .values()
            .any(|c| c.state == ConnState::Initialized)
        {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        let mut timeout = self
            .timers
            .next_deadline()
            .map(|d| d.saturating_duration_since(now));
        // Nothing watched and nothing armed: an indefinite sleep would
        // never wake.
        if timeout.is_none() && !self.conns.values().any(|c| c.interest.is_some()) {
            return Some(Duration::ZERO);
        }
        if self.config.account_for_signals {
            let tick = self.config.tick_timeout;
            timeout = Some(timeout.map_or(tick, |t| t.min(tick)));
        }
        timeout
    }

    fn kick_initialized(&mut self) {
        let ids: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.state == ConnState::Initialized)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(mut conn) = self.conns.remove(&id) else {
                continue;
            };
            self.start_attempt(&mut conn);
            self.conns.insert(id, conn);
        }
    }

    fn dispatch_io(&mut self, id: ConnId, readable: bool, writable: bool) {
        let Some(mut conn) = self.conns.remove(&id) else {
            return;
        };
        self.on_ready(&mut conn, readable, writable);
        self.conns.insert(id, conn);
    }

    fn dispatch_timer(&mut self, id: ConnId, kind: TimerKind) {
        let Some(mut conn) = self.conns.remove(&id) else {
            return;
        };
        self.on_timer(&mut conn, kind);
        self.conns.insert(id, conn);
    }

    fn flush_staged(&mut self) {
        while !self.staged.is_empty() || !self.staged_drops.is_empty() {
            let staged: Vec<Connection> = self.staged.drain(..).collect();
            for conn in staged {
                self.absorb(conn);
            }
            let drops: Vec<ConnId> = std::mem::take(&mut self.staged_drops);
            for id in drops {
                self.drop_conn(id);
            }
        }
    }

    fn absorb(&mut self, mut conn: Connection) {
        metrics::CONNECTIONS_ACTIVE.increment();
        if let Some(deadline) = conn.request_deadline {
            conn.request_timer = Some(self.timers.arm(deadline, conn.id, TimerKind::Request));
        }
        let id = conn.id;
        self.to_state(&mut conn, ConnState::Initialized);
        self.conns.insert(id, conn);
    }

    // ── State transitions ──────────────────────────────────────────

    /// Enter a state: record it, then fire the matching hook before any
    /// I/O work. A failing hook routes to the user-action phase with an
    /// internal error; a panicking hook forcibly completes the
    /// connection. Returns false when the transition was diverted.
    fn to_state(&mut self, conn: &mut Connection, state: ConnState) -> bool {
        conn.set_state(state);
        let hook = match state {
            ConnState::Initialized => conn.request.hooks.init.clone(),
            ConnState::Connecting => conn.request.hooks.connecting.clone(),
            ConnState::Connected => conn.request.hooks.connected.clone(),
            ConnState::Writing => conn.request.hooks.writing.clone(),
            ConnState::Reading => conn.request.hooks.reading.clone(),
            _ => None,
        };
        match fire_hook(conn, hook) {
            HookOutcome::Ran => true,
            HookOutcome::Failed(msg) => {
                let message = format!("{state} hook failed: {msg}");
                conn.push_error(ErrorKind::Internal, message.clone());
                metrics::ERRORS_RECORDED.increment();
                self.teardown_attempt(conn);
                self.enter_user_action(conn, ErrorKind::Internal, message);
                false
            }
            HookOutcome::Panicked => {
                self.force_complete(conn);
                false
            }
        }
    }

    fn start_attempt(&mut self, conn: &mut Connection) {
        let attempt = conn.attempt;
        conn.attempt += 1;
        let target =
            match conn
                .request
                .host
                .select(attempt, conn.request.port, conn.request.scheme)
            {
                Ok(t) => t,
                Err(msg) => {
                    self.fail(conn, ErrorKind::Request, msg);
                    return;
                }
            };
        conn.target = Some(target);

        if !self.to_state(conn, ConnState::ResolveDns) {
            return;
        }
        // Synchronous resolution through the system resolver; the state
        // is reserved for an async resolver.
        let resolve_err = match conn.target.as_mut() {
            Some(t) if t.ip.is_none() => t
                .resolve()
                .err()
                .map(|e| format!("resolve {}: {e}", t.host)),
            _ => None,
        };
        if let Some(msg) = resolve_err {
            self.fail(conn, ErrorKind::Connect, msg);
            return;
        }
        self.begin_connect(conn);
    }

    fn begin_connect(&mut self, conn: &mut Connection) {
        if !self.to_state(conn, ConnState::Connecting) {
            return;
        }
        if let Some(timeout) = conn.request.connect_timeout {
            conn.connect_timer =
                Some(self.timers.arm(Instant::now() + timeout, conn.id, TimerKind::Connect));
        }

        // Idle socket reuse: adopt the cached socket and skip the
        // connect (and, for an established TLS session, the handshake).
        if let Some(cache) = self.config.socket_cache.clone() {
            let key = conn.target.as_ref().map(CacheKey::for_target);
            if let Some(key) = key
                && let Some(cached) = cache.borrow_mut().take(&key)
            {
                metrics::CONNECTIONS_REUSED.increment();
                conn.sock = Some(cached.sock);
                conn.reused_socket = true;
                #[cfg(feature = "tls")]
                {
                    conn.tls = cached.tls;
                    if conn.tls.as_ref().is_some_and(|t| t.is_established()) {
                        if let Some(t) = conn.connect_timer.take() {
                            self.timers.cancel(t);
                        }
                        self.enter_writing(conn);
                        return;
                    }
                }
                self.finish_connect(conn);
                return;
            }
        }

        let scheme = conn
            .target
            .as_ref()
            .map(|t| t.scheme)
            .unwrap_or(conn.request.scheme);
        #[cfg(feature = "tls")]
        if scheme == Scheme::Https && self.config.tls_client.is_none() {
            self.fail_terminal(conn, ErrorKind::Tls, "no TLS client configuration".to_string());
            return;
        }
        #[cfg(not(feature = "tls"))]
        if scheme == Scheme::Https {
            self.fail_terminal(conn, ErrorKind::Tls, "TLS support not compiled in".to_string());
            return;
        }

        let Some(addr) = conn.target.as_ref().and_then(|t| t.addr()) else {
            self.fail(conn, ErrorKind::Connect, "target has no resolved address".to_string());
            return;
        };
        let sock = match TcpStream::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                self.fail(conn, ErrorKind::Connect, format!("connect {addr}: {e}"));
                return;
            }
        };
        if self.config.tcp_nodelay {
            let _ = sock.set_nodelay(true);
        }
        metrics::CONNECTIONS_OPENED.increment();
        conn.sock = Some(sock);
        // Completion lands in `connect_ready` on writability.
        self.watch(conn, Interest::WRITABLE);
    }

    /// Writable readiness while connecting: decide success or failure.
    fn connect_ready(&mut self, conn: &mut Connection) {
        let Some(sock) = conn.sock.as_mut() else {
            return;
        };
        let err = match sock.take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => None,
        };
        if let Some(e) = err {
            self.fail(conn, ErrorKind::Connect, format!("connect: {e}"));
            return;
        }
        match sock.peer_addr() {
            Ok(_) => {}
            // Not established yet; keep waiting for the next event.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
            Err(e) => {
                self.fail(conn, ErrorKind::Connect, format!("connect: {e}"));
                return;
            }
        }
        self.finish_connect(conn);
    }

    fn finish_connect(&mut self, conn: &mut Connection) {
        if !self.to_state(conn, ConnState::Connected) {
            return;
        }
        let https = conn
            .target
            .as_ref()
            .is_some_and(|t| t.scheme == Scheme::Https);
        if !https {
            // The connect deadline ends here for plaintext; for https it
            // spans the handshake.
            if let Some(t) = conn.connect_timer.take() {
                self.timers.cancel(t);
            }
            self.enter_writing(conn);
            return;
        }
        #[cfg(feature = "tls")]
        self.begin_handshake(conn);
        #[cfg(not(feature = "tls"))]
        self.fail_terminal(conn, ErrorKind::Tls, "TLS support not compiled in".to_string());
    }

    #[cfg(feature = "tls")]
    fn begin_handshake(&mut self, conn: &mut Connection) {
        let Some(tls_config) = self.config.tls_client.clone() else {
            self.fail_terminal(conn, ErrorKind::Tls, "no TLS client configuration".to_string());
            return;
        };
        let host = conn
            .target
            .as_ref()
            .map(|t| t.host.clone())
            .unwrap_or_default();
        match crate::tls::TlsSession::new(tls_config, &host) {
            Ok(tls) => conn.tls = Some(tls),
            Err(msg) => {
                self.fail_terminal(conn, ErrorKind::Tls, msg);
                return;
            }
        }
        if !self.to_state(conn, ConnState::TlsHandshake) {
            return;
        }
        self.continue_handshake(conn);
    }

    #[cfg(feature = "tls")]
    fn continue_handshake(&mut self, conn: &mut Connection) {
        let progress = {
            let Some(sock) = conn.sock.as_mut() else {
                return;
            };
            let Some(tls) = conn.tls.as_mut() else {
                return;
            };
            tls.drive_handshake(sock)
        };
        match progress {
            Ok(true) => {
                if let Some(t) = conn.connect_timer.take() {
                    self.timers.cancel(t);
                }
                self.enter_writing(conn);
            }
            Ok(false) => {
                let wants = conn.tls.as_ref().map(|t| t.wants()).unwrap_or((true, false));
                let interest = match wants {
                    (true, true) => Interest::READABLE | Interest::WRITABLE,
                    (false, true) => Interest::WRITABLE,
                    _ => Interest::READABLE,
                };
                self.watch(conn, interest);
            }
            Err(e) => self.fail(conn, ErrorKind::Tls, format!("handshake: {e}")),
        }
    }

    fn enter_writing(&mut self, conn: &mut Connection) {
        if !self.to_state(conn, ConnState::Writing) {
            return;
        }
        conn.write_buf = conn.request.serialize();
        conn.write_pos = 0;
        if let Some(timeout) = conn.request.drain_timeout {
            conn.drain_timer =
                Some(self.timers.arm(Instant::now() + timeout, conn.id, TimerKind::Drain));
        }
        self.continue_write(conn);
    }

    fn continue_write(&mut self, conn: &mut Connection) {
        loop {
            if conn.write_pos >= conn.write_buf.len() {
                // Plaintext drained; for TLS, flush buffered ciphertext.
                #[cfg(feature = "tls")]
                if let Some(tls) = conn.tls.as_mut()
                    && tls.wants_write()
                {
                    let Some(sock) = conn.sock.as_mut() else {
                        return;
                    };
                    match tls.flush_cipher(sock) {
                        Ok(true) => {}
                        Ok(false) => {
                            self.watch(conn, Interest::WRITABLE);
                            return;
                        }
                        Err(e) => {
                            self.fail(conn, ErrorKind::Write, format!("write: {e}"));
                            return;
                        }
                    }
                }
                self.enter_reading(conn);
                return;
            }

            let res = {
                let Some(sock) = conn.sock.as_mut() else {
                    return;
                };
                let data = &conn.write_buf[conn.write_pos..];
                #[cfg(feature = "tls")]
                let res = match conn.tls.as_mut() {
                    Some(tls) => tls.write_plain(sock, data),
                    None => sock.write(data),
                };
                #[cfg(not(feature = "tls"))]
                let res = sock.write(data);
                res
            };
            match res {
                Ok(0) => {
                    self.fail(conn, ErrorKind::Write, "write returned zero".to_string());
                    return;
                }
                Ok(n) => {
                    conn.write_pos += n;
                    metrics::BYTES_SENT.add(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.watch(conn, Interest::WRITABLE);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.fail(conn, ErrorKind::Write, format!("write: {e}"));
                    return;
                }
            }
        }
    }

    fn enter_reading(&mut self, conn: &mut Connection) {
        if let Some(t) = conn.drain_timer.take() {
            self.timers.cancel(t);
        }
        if !self.to_state(conn, ConnState::Reading) {
            return;
        }
        conn.parser = Some(ResponseParser::new());
        if !self.watch(conn, Interest::READABLE) {
            return;
        }
        // TLS may already hold buffered plaintext.
        self.continue_read(conn);
    }

    fn continue_read(&mut self, conn: &mut Connection) {
        loop {
            let hint = match conn.parser.as_ref() {
                Some(p) => p.read_hint(),
                None => return,
            };
            if hint == 0 {
                self.finish_response(conn);
                return;
            }
            let mut chunk = [0u8; READ_CHUNK];
            let want = hint.min(READ_CHUNK);
            let res = {
                let Some(sock) = conn.sock.as_mut() else {
                    return;
                };
                #[cfg(feature = "tls")]
                let res = match conn.tls.as_mut() {
                    Some(tls) => tls.read_plain(sock, &mut chunk[..want]),
                    None => sock.read(&mut chunk[..want]),
                };
                #[cfg(not(feature = "tls"))]
                let res = sock.read(&mut chunk[..want]);
                res
            };
            match res {
                Ok(0) => {
                    self.fail(
                        conn,
                        ErrorKind::Read,
                        "connection closed before response complete".to_string(),
                    );
                    return;
                }
                Ok(n) => {
                    metrics::BYTES_RECEIVED.add(n as u64);
                    let pushed = match conn.parser.as_mut() {
                        Some(p) => p.push(&chunk[..n]),
                        None => return,
                    };
                    if let Err(e) = pushed {
                        let kind = e.kind();
                        self.fail_terminal(conn, kind, e.to_string());
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.watch(conn, Interest::READABLE);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.fail(conn, ErrorKind::Read, format!("read: {e}"));
                    return;
                }
            }
        }
    }

    fn finish_response(&mut self, conn: &mut Connection) {
        let Some(parser) = conn.parser.take() else {
            return;
        };
        conn.response = Some(parser.finish());
        // The socket leaves the connection before the user-action phase:
        // back to the cache on clean keep-alive, closed otherwise.
        self.dispose_socket(conn, true);
        self.enter_user_action(conn, ErrorKind::NoError, String::new());
    }

    // ── User action and completion ─────────────────────────────────

    fn enter_user_action(&mut self, conn: &mut Connection, kind: ErrorKind, message: String) {
        if conn.user_action_entered {
            self.complete(conn);
            return;
        }
        conn.user_action_entered = true;
        conn.set_state(ConnState::UserAction);

        let mut decision = Decision::Proceed;
        if let Some(cb) = conn.request.callback.clone() {
            let panicked = {
                let mut ctx = UserCtx {
                    conn,
                    kind,
                    message: &message,
                    decision: &mut decision,
                    staged: &mut self.staged,
                    staged_drops: &mut self.staged_drops,
                    breaking: &mut self.breaking,
                    next_id: &mut self.next_id,
                    defaults: &self.config.defaults,
                    keep_timeline: self.config.keep_timeline,
                };
                let mut f = cb.borrow_mut();
                panic::catch_unwind(AssertUnwindSafe(|| (&mut *f)(&mut ctx))).is_err()
            };
            if panicked {
                self.force_complete(conn);
                return;
            }
        }

        match decision {
            Decision::Proceed | Decision::Drop => self.complete(conn),
            Decision::Retry => {
                conn.attempts_left = conn.attempts_left.saturating_sub(1);
                self.reset_for_retry(conn);
            }
            Decision::Reinit(overrides) => {
                overrides.apply_to(&mut conn.request);
                conn.attempts_left = conn.request.retries.saturating_add(1);
                conn.attempt = 0;
                self.reset_for_retry(conn);
            }
        }
    }

    fn complete(&mut self, conn: &mut Connection) {
        self.dispose_socket(conn, false);
        self.cancel_all_timers(conn);
        if conn.response.is_some() {
            metrics::RESPONSES_COMPLETED.increment();
        }
        conn.set_state(ConnState::Completed);
        metrics::CONNECTIONS_ACTIVE.decrement();
    }

    /// Completion without callbacks or caching (a callback panicked).
    fn force_complete(&mut self, conn: &mut Connection) {
        self.dispose_socket(conn, false);
        self.cancel_all_timers(conn);
        conn.set_state(ConnState::Completed);
        metrics::CONNECTIONS_ACTIVE.decrement();
    }

    // ── Failure branches ───────────────────────────────────────────

    /// Recoverable failure: append the error, abandon the attempt, and
    /// either reset for a retry or take the failure branch.
    fn fail(&mut self, conn: &mut Connection, kind: ErrorKind, message: String) {
        conn.push_error(kind, message);
        metrics::ERRORS_RECORDED.increment();
        if kind.is_timeout() {
            metrics::TIMEOUTS.increment();
        }
        self.teardown_attempt(conn);
        conn.attempts_left = conn.attempts_left.saturating_sub(1);
        if conn.attempts_left > 0 {
            metrics::RETRIES.increment();
            self.reset_for_retry(conn);
        } else {
            let (kind, message) = conn
                .last_error()
                .map(|e| (e.kind, e.message.clone()))
                .unwrap_or((ErrorKind::Internal, String::new()));
            self.enter_user_action(conn, kind, message);
        }
    }

    /// Terminal failure: straight to the user-action phase.
    fn fail_terminal(&mut self, conn: &mut Connection, kind: ErrorKind, message: String) {
        conn.push_error(kind, message.clone());
        metrics::ERRORS_RECORDED.increment();
        self.teardown_attempt(conn);
        self.enter_user_action(conn, kind, message);
    }

    fn reset_for_retry(&mut self, conn: &mut Connection) {
        self.teardown_attempt(conn);
        conn.user_action_entered = false;
        // The end-to-end deadline keeps its original instant; rearm it
        // if it already fired so exhaustion still surfaces.
        if conn.request_timer.is_none()
            && let Some(deadline) = conn.request_deadline
        {
            conn.request_timer = Some(self.timers.arm(deadline, conn.id, TimerKind::Request));
        }
        self.to_state(conn, ConnState::Initialized);
        // The next attempt starts on the following loop iteration.
    }

    fn on_timer(&mut self, conn: &mut Connection, kind: TimerKind) {
        match kind {
            TimerKind::Connect => conn.connect_timer = None,
            TimerKind::Drain => conn.drain_timer = None,
            TimerKind::Request => conn.request_timer = None,
        }
        if matches!(conn.state, ConnState::UserAction | ConnState::Completed) {
            return;
        }
        let (ekind, msg) = match kind {
            TimerKind::Connect => (ErrorKind::ConnectTimeout, "connect timed out"),
            TimerKind::Drain => (ErrorKind::DrainTimeout, "request write timed out"),
            TimerKind::Request => (ErrorKind::RequestTimeout, "request timed out"),
        };
        self.fail(conn, ekind, msg.to_string());
    }

    fn on_ready(&mut self, conn: &mut Connection, readable: bool, writable: bool) {
        match conn.state {
            ConnState::Connecting if writable => self.connect_ready(conn),
            #[cfg(feature = "tls")]
            ConnState::TlsHandshake if readable || writable => self.continue_handshake(conn),
            ConnState::Writing if writable => self.continue_write(conn),
            ConnState::Reading if readable => self.continue_read(conn),
            _ => {}
        }
    }

    // ── Resource bookkeeping ───────────────────────────────────────

    /// Reconcile the registered readiness interest with `want`. On
    /// registration failure the attempt is failed; returns whether the
    /// connection is still on its happy path.
    fn watch(&mut self, conn: &mut Connection, want: Interest) -> bool {
        match self.set_interest(conn, Some(want)) {
            Ok(()) => true,
            Err(e) => {
                self.fail(conn, ErrorKind::Internal, format!("watcher registration: {e}"));
                false
            }
        }
    }

    fn set_interest(&mut self, conn: &mut Connection, want: Option<Interest>) -> io::Result<()> {
        let token = Token(conn.id as usize);
        match (conn.interest, want) {
            (None, Some(w)) => {
                if let Some(sock) = conn.sock.as_mut() {
                    self.poller.register(sock, token, w)?;
                    conn.interest = Some(w);
                }
            }
            (Some(cur), Some(w)) if cur != w => {
                if let Some(sock) = conn.sock.as_mut() {
                    self.poller.reregister(sock, token, w)?;
                    conn.interest = Some(w);
                }
            }
            (Some(_), None) => {
                if let Some(sock) = conn.sock.as_mut() {
                    let _ = self.poller.deregister(sock);
                }
                conn.interest = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Release the attempt's socket, TLS session, per-attempt timers,
    /// and I/O buffers. Errors and timeline are kept.
    fn teardown_attempt(&mut self, conn: &mut Connection) {
        if let Some(mut sock) = conn.sock.take() {
            if conn.interest.is_some() {
                let _ = self.poller.deregister(&mut sock);
                conn.interest = None;
            }
        }
        if let Some(t) = conn.connect_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(t) = conn.drain_timer.take() {
            self.timers.cancel(t);
        }
        conn.clear_attempt();
    }

    fn cancel_all_timers(&mut self, conn: &mut Connection) {
        if let Some(t) = conn.connect_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(t) = conn.drain_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(t) = conn.request_timer.take() {
            self.timers.cancel(t);
        }
    }

    /// Detach the connection's socket: back to the cache when eligible
    /// (clean keep-alive completion, cache configured), closed otherwise.
    fn dispose_socket(&mut self, conn: &mut Connection, cache_allowed: bool) {
        let Some(mut sock) = conn.sock.take() else {
            #[cfg(feature = "tls")]
            {
                conn.tls = None;
            }
            return;
        };
        if conn.interest.is_some() {
            let _ = self.poller.deregister(&mut sock);
            conn.interest = None;
        }
        let keep_alive = conn.response.as_ref().is_some_and(|r| r.keep_alive());
        let clean = conn.errors.is_empty();
        if cache_allowed
            && keep_alive
            && clean
            && let (Some(cache), Some(target)) = (&self.config.socket_cache, &conn.target)
        {
            cache.borrow_mut().insert(
                CacheKey::for_target(target),
                CachedSocket {
                    sock,
                    #[cfg(feature = "tls")]
                    tls: conn.tls.take(),
                },
            );
            metrics::CONNECTIONS_CACHED.increment();
        } else {
            drop(sock);
            #[cfg(feature = "tls")]
            {
                conn.tls = None;
            }
        }
    }
}

fn fire_hook(conn: &Connection, hook: Option<StateHook>) -> HookOutcome {
    let Some(hook) = hook else {
        return HookOutcome::Ran;
    };
    let mut f = hook.borrow_mut();
    match panic::catch_unwind(AssertUnwindSafe(|| (&mut *f)(conn))) {
        Ok(Ok(())) => HookOutcome::Ran,
        Ok(Err(e)) => HookOutcome::Failed(e.to_string()),
        Err(_) => HookOutcome::Panicked,
    }
}

//! fanline — event-driven HTTP/1.x client for fan-out workloads.
//!
//! fanline drives many concurrent HTTP requests through an explicit
//! per-connection state machine, one step above raw sockets: no
//! redirects, no proxies, no cookies, no content decoding. Each request
//! may name a pool of candidate hosts cycled across retries, carries
//! three independent deadlines (connect, drain, end-to-end), and fires
//! per-state hooks plus a terminal callback that can retry, reinitialize,
//! or drop its connection mid-dispatch.
//!
//! Everything runs on one thread over a readiness poller. Responses must
//! carry a Content-Length; bodies are raw bytes.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fanline::{Client, Config, RequestOpts, callback};
//!
//! fn main() -> Result<(), fanline::Error> {
//!     let mut client = Client::new(Config::new())?;
//!     client.request(RequestOpts {
//!         host: Some("127.0.0.1:8080".into()),
//!         path: Some("/status".to_string()),
//!         callback: Some(callback(|ctx| {
//!             if let Some(resp) = ctx.response() {
//!                 println!("{} -> {}", ctx.conn().url().unwrap(), resp.status());
//!             } else {
//!                 eprintln!("failed: {}", ctx.error_message());
//!             }
//!         })),
//!         ..Default::default()
//!     })?;
//!     client.run()
//! }
//! ```
//!
//! # Fan-out
//!
//! Submit any number of requests before (or during, from callbacks)
//! `run`; the driver multiplexes all of them over one poller. A request's
//! `host` may be a `"host[:port]"` string, an ordered pool cycled
//! round-robin per attempt, or a callable choosing per attempt.
//!
//! # Socket reuse
//!
//! Pass a shared [`SocketCache`] in [`Config::socket_cache`] and clean
//! keep-alive HTTP/1.1 completions park their socket (with its TLS
//! session) for the next request to the same `(host, port, scheme)`.

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod poller;
#[cfg(feature = "tls")]
pub(crate) mod tls;
pub(crate) mod timer;

// ── Public modules ──────────────────────────────────────────────────
pub mod cache;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod request;
pub mod response;
pub mod target;

// ── Re-exports: driver ──────────────────────────────────────────────

/// The event-driven HTTP client.
pub use driver::Client;
/// Dispatch context handed to the terminal callback.
pub use driver::UserCtx;

// ── Re-exports: configuration and requests ──────────────────────────

/// Client configuration: request defaults plus driver options.
pub use config::Config;
/// Per-request options; unset fields inherit the client defaults.
pub use request::RequestOpts;
/// A single HTTP request record.
pub use request::Request;

// ── Re-exports: connections ─────────────────────────────────────────

/// Stable connection identifier.
pub use connection::ConnId;
/// Connection lifecycle states.
pub use connection::ConnState;
/// One entry in a connection's error timeline.
pub use connection::ConnError;
/// A request's lifecycle record, exposed for inspection.
pub use connection::Connection;

// ── Re-exports: responses and errors ────────────────────────────────

/// Parsed HTTP response.
pub use response::Response;
/// Driver-surface errors.
pub use error::Error;
/// Stable per-connection error taxonomy.
pub use error::ErrorKind;

// ── Re-exports: callbacks ───────────────────────────────────────────

/// Wrap a closure as a per-state hook.
pub use hooks::hook;
/// Wrap a closure as a terminal callback.
pub use hooks::callback;
/// Per-state hook set carried by a request.
pub use hooks::Hooks;
/// Error type returned by per-state hooks.
pub use hooks::HookError;
/// Per-state hook callback type.
pub use hooks::StateHook;
/// Terminal callback type.
pub use hooks::TerminalFn;

// ── Re-exports: targets and caching ─────────────────────────────────

/// Destination specification for a request.
pub use target::HostSpec;
/// Result of a per-attempt host callable.
pub use target::HostPick;
/// Resolved destination for a single attempt.
pub use target::Target;
/// URL scheme.
pub use target::Scheme;
/// Caller-owned idle socket pool.
pub use cache::SocketCache;

//! Client configuration.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::cache::SocketCache;
use crate::error::Error;
use crate::request::RequestOpts;

/// Client configuration: request-level defaults plus driver options.
#[derive(Clone)]
pub struct Config {
    /// Defaults inherited by every request; per-request options override
    /// field by field.
    pub defaults: RequestOpts,
    /// Opt-in idle socket cache, shared with the caller. The driver
    /// inserts and removes entries; the caller owns eviction.
    pub socket_cache: Option<Rc<RefCell<SocketCache>>>,
    /// Cap the poll timeout at `tick_timeout` so the loop turns (and the
    /// host's pending signal handlers run) even when no I/O is ready.
    /// Costs a small amount of idle wakeup work.
    pub account_for_signals: bool,
    /// Record every state transition with a timestamp on each connection.
    pub keep_timeline: bool,
    /// Maximum time a blocking poll may sleep when `account_for_signals`
    /// is set.
    pub tick_timeout: Duration,
    /// Set TCP_NODELAY on every new outbound socket.
    pub tcp_nodelay: bool,
    /// Readiness event buffer capacity.
    pub event_capacity: usize,
    /// Pre-built rustls client configuration for https targets. The
    /// caller loads roots and configures ALPN etc.
    #[cfg(feature = "tls")]
    pub tls_client: Option<std::sync::Arc<rustls::ClientConfig>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Config {
            defaults: RequestOpts::default(),
            socket_cache: None,
            account_for_signals: false,
            keep_timeline: false,
            tick_timeout: Duration::from_millis(1),
            tcp_nodelay: true,
            event_capacity: 256,
            #[cfg(feature = "tls")]
            tls_client: None,
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_capacity must be > 0".to_string(),
            ));
        }
        if self.account_for_signals && self.tick_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "tick_timeout must be > 0 when account_for_signals is set".to_string(),
            ));
        }
        if let Some(retries) = self.defaults.retries
            && retries == u32::MAX
        {
            return Err(Error::InvalidConfig("retries out of range".to_string()));
        }
        Ok(())
    }
}

//! Thin adapter over the mio readiness loop.
//!
//! The driver owns watcher bookkeeping (which connection wants which
//! interest) and all timers; this module only registers interest and
//! runs a timed poll.

use std::io;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

/// One readiness event: token plus collapsed read/write flags. Peer
/// close and error conditions are folded into the flags so the state
/// machine observes them through its normal read/write paths.
pub(crate) struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    pub(crate) fn register(
        &mut self,
        sock: &mut TcpStream,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(sock, token, interest)
    }

    pub(crate) fn reregister(
        &mut self,
        sock: &mut TcpStream,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(sock, token, interest)
    }

    pub(crate) fn deregister(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(sock)
    }

    /// Wait for readiness. An interrupted poll returns normally with no
    /// events so pending signal handlers get their loop turn.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.events.clear();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Events from the last poll.
    pub(crate) fn ready(&self) -> Vec<Ready> {
        self.events
            .iter()
            .map(|ev| Ready {
                token: ev.token(),
                readable: ev.is_readable() || ev.is_read_closed() || ev.is_error(),
                writable: ev.is_writable() || ev.is_write_closed() || ev.is_error(),
            })
            .collect()
    }
}

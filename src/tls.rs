//! Streaming TLS adapter for outbound connections.
//!
//! Wraps a rustls `ClientConnection` with non-blocking read/write and a
//! progressable handshake. The driver re-registers read or write
//! readiness according to [`TlsSession::wants`] while handshaking.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::ClientConnection;
use rustls::pki_types::ServerName;

/// Per-connection TLS state.
pub(crate) struct TlsSession {
    conn: ClientConnection,
    handshake_complete: bool,
}

impl TlsSession {
    pub(crate) fn new(config: Arc<rustls::ClientConfig>, host: &str) -> Result<Self, String> {
        let name = ServerName::try_from(host.to_owned())
            .map_err(|e| format!("invalid server name {host:?}: {e}"))?;
        let conn = ClientConnection::new(config, name).map_err(|e| e.to_string())?;
        Ok(TlsSession {
            conn,
            handshake_complete: false,
        })
    }

    pub(crate) fn is_established(&self) -> bool {
        self.handshake_complete
    }

    /// Readiness wanted while handshaking, as (read, write).
    pub(crate) fn wants(&self) -> (bool, bool) {
        (self.conn.wants_read(), self.conn.wants_write())
    }

    /// Whether ciphertext is buffered waiting for the socket.
    pub(crate) fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Advance the handshake as far as the socket allows. `Ok(true)` once
    /// complete; `Ok(false)` means re-register per [`TlsSession::wants`].
    pub(crate) fn drive_handshake<S: Read + Write>(&mut self, sock: &mut S) -> io::Result<bool> {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(sock) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
            if self.conn.wants_read() {
                match self.conn.read_tls(sock) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed during handshake",
                        ));
                    }
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
        }
        self.handshake_complete = true;
        Ok(true)
    }

    /// Write plaintext, flushing ciphertext as the socket allows. Returns
    /// the number of plaintext bytes accepted.
    pub(crate) fn write_plain<S: Write>(&mut self, sock: &mut S, data: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(data)?;
        match self.flush_cipher(sock) {
            Ok(_) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(n),
            Err(e) => Err(e),
        }
    }

    /// Pump buffered ciphertext to the socket. `Ok(true)` when drained.
    pub(crate) fn flush_cipher<S: Write>(&mut self, sock: &mut S) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Read decrypted plaintext. `Ok(0)` means the peer closed;
    /// `WouldBlock` means no ciphertext is available yet.
    pub(crate) fn read_plain<S: Read>(&mut self, sock: &mut S, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }
            match self.conn.read_tls(sock) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

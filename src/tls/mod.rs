//! TLS handshake and I/O, implemented over `rustls` instead of the
//! original OpenSSL `SSL_CTX`. Certificate/key loading failures return a
//! `Result` rather than aborting the process, since a single bad
//! `network.ssl` config shouldn't take the whole server down before it
//! even starts serving plaintext listeners.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::TlsError;

/// Built once at startup from `network.ssl.cert_path`/`key_path`, then
/// shared (via `Arc`) across every TLS-enabled connection.
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    pub fn load(cert_path: &str, key_path: &str) -> Result<Self, TlsError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsContext {
            config: Arc::new(config),
        })
    }

    pub fn new_session(&self) -> Result<TlsSession, TlsError> {
        let conn = ServerConnection::new(self.config.clone())?;
        Ok(TlsSession { conn })
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::CertRead { path: path.to_string(), source })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::CertRead { path: path.to_string(), source })
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::KeyRead { path: path.to_string(), source })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::KeyRead { path: path.to_string(), source })?
        .ok_or_else(|| TlsError::NoKey(path.to_string()))
}

/// What an `EventLoop`-driven direction wants next. Mirrors the original's
/// `SSL_ERROR_WANT_READ`/`WANT_WRITE` handshake bookkeeping, generalized
/// to cover post-handshake application I/O too (a full rustls outgoing
/// buffer also reports `WantWrite`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDemand {
    Satisfied,
    WantRead,
    WantWrite,
}

/// One TLS session wrapping a single connection's encrypted I/O.
/// `read_plaintext`/`write_plaintext` drive the handshake transparently
/// as a side effect, matching `SSL_read`/`SSL_write` semantics: the first
/// calls after connection accept perform the handshake before any
/// application bytes flow.
pub struct TlsSession {
    conn: ServerConnection,
}

impl TlsSession {
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Pulls ciphertext from `raw` into rustls, then decrypts as much
    /// plaintext as is available into `out`. Returns the number of
    /// plaintext bytes written.
    pub fn read_plaintext(&mut self, raw: &mut impl Read, out: &mut Vec<u8>) -> io::Result<(usize, IoDemand)> {
        match self.conn.read_tls(raw) {
            Ok(0) => return Ok((0, IoDemand::Satisfied)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let state = self
            .conn
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut plaintext = vec![0u8; state.plaintext_bytes_to_read()];
        let n = if plaintext.is_empty() {
            0
        } else {
            self.conn.reader().read(&mut plaintext)?
        };
        out.extend_from_slice(&plaintext[..n]);

        let demand = if self.conn.wants_write() {
            IoDemand::WantWrite
        } else if self.conn.wants_read() {
            IoDemand::WantRead
        } else {
            IoDemand::Satisfied
        };
        Ok((n, demand))
    }

    /// Encrypts `data` and flushes as much ciphertext as `raw` accepts.
    pub fn write_plaintext(&mut self, data: &[u8], raw: &mut impl Write) -> io::Result<usize> {
        let n = self.conn.writer().write(data)?;
        self.flush_ciphertext(raw)?;
        Ok(n)
    }

    /// Pushes any ciphertext rustls has queued (handshake records
    /// included) out to the raw socket.
    pub fn flush_ciphertext(&mut self, raw: &mut impl Write) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(raw) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{RootCertStore, ServerConfig, ServerConnection};
use tracing::debug;

use crate::config::TlsSettings;
use crate::error::{KilnError, KilnResult};
use crate::syscalls;

/// Outcome of one handshake-driving pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake finished; the protocol may run.
    Complete,
    /// More bytes from the peer are needed; re-register READ.
    NeedRead,
    /// Pending handshake bytes could not be flushed; re-register WRITE.
    NeedWrite,
    /// Handshake failed; the connection must be closed.
    Failed,
}

/// Raw-fd Read/Write adapter feeding rustls its wire bytes.
struct FdIo(i32);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match syscalls::read_nonblocking(self.0, buf) {
            Ok(Some(n)) => Ok(n),
            Ok(None) => Err(io::Error::new(io::ErrorKind::WouldBlock, "read would block")),
            Err(KilnError::Io(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match syscalls::write_nonblocking(self.0, buf) {
            Ok(Some(n)) => Ok(n),
            Ok(None) => Err(io::Error::new(io::ErrorKind::WouldBlock, "write would block")),
            Err(KilnError::Io(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Build the process-wide rustls server config from the TLS settings.
pub fn build_server_config(settings: &TlsSettings) -> KilnResult<Arc<ServerConfig>> {
    let certs = load_certs(&settings.cert_file)?;
    let key = load_private_key(&settings.key_file)?;

    let mut versions = Vec::new();
    for proto in &settings.protocols {
        match proto.as_str() {
            "TLSv1.2" => versions.push(&rustls::version::TLS12),
            "TLSv1.3" => versions.push(&rustls::version::TLS13),
            other => {
                return Err(KilnError::Tls(format!("unsupported protocol: {other}")));
            }
        }
    }
    if versions.is_empty() {
        return Err(KilnError::Tls("no TLS protocol versions configured".into()));
    }

    let builder = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&versions)
        .map_err(|e| KilnError::Tls(e.to_string()))?;

    let config = if settings.client_auth {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&settings.ca_file)? {
            roots
                .add(&cert)
                .map_err(|e| KilnError::Tls(format!("bad CA certificate: {e}")))?;
        }
        builder
            .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots)))
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| KilnError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

fn load_certs(path: &str) -> KilnResult<Vec<rustls::Certificate>> {
    let file = File::open(path)
        .map_err(|e| KilnError::Tls(format!("cannot open certificate file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| KilnError::Tls(format!("bad certificate file {path}: {e}")))?;
    if certs.is_empty() {
        return Err(KilnError::Tls(format!("no certificates in {path}")));
    }
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &str) -> KilnResult<rustls::PrivateKey> {
    let file =
        File::open(path).map_err(|e| KilnError::Tls(format!("cannot open key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| KilnError::Tls(format!("bad key file {path}: {e}")))?
        {
            Some(rustls_pemfile::Item::PKCS8Key(key)) | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
            Some(_) => continue,
            None => return Err(KilnError::Tls(format!("no private key in {path}"))),
        }
    }
}

/// Per-connection TLS engine. All calls are made with the connection's
/// processing lock held, so the session needs no locking of its own.
pub struct TlsSession {
    session: ServerConnection,
}

impl TlsSession {
    pub fn new(config: Arc<ServerConfig>) -> KilnResult<Self> {
        let session = ServerConnection::new(config).map_err(|e| KilnError::Tls(e.to_string()))?;
        Ok(Self { session })
    }

    pub fn is_handshake_complete(&self) -> bool {
        !self.session.is_handshaking()
    }

    /// Advance the handshake as far as the socket allows.
    pub fn drive_handshake(&mut self, fd: i32) -> HandshakeStatus {
        let mut io = FdIo(fd);
        loop {
            if self.session.wants_write() {
                match self.session.write_tls(&mut io) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return HandshakeStatus::NeedWrite;
                    }
                    Err(e) => {
                        debug!(error = %e, "TLS handshake write failed");
                        return HandshakeStatus::Failed;
                    }
                }
                continue;
            }
            if !self.session.is_handshaking() {
                return HandshakeStatus::Complete;
            }
            match self.session.read_tls(&mut io) {
                Ok(0) => {
                    debug!("peer closed during TLS handshake");
                    return HandshakeStatus::Failed;
                }
                Ok(_) => {
                    if let Err(e) = self.session.process_new_packets() {
                        debug!(error = %e, "TLS handshake processing failed");
                        // Flush any alert before giving up.
                        let _ = self.session.write_tls(&mut io);
                        return HandshakeStatus::Failed;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStatus::NeedRead;
                }
                Err(e) => {
                    debug!(error = %e, "TLS handshake read failed");
                    return HandshakeStatus::Failed;
                }
            }
        }
    }

    /// Read decrypted bytes. Mirrors the raw-socket contract:
    /// Ok(Some(0)) is EOF, Ok(None) means no bytes available yet.
    pub fn read_plain(&mut self, fd: i32, buf: &mut [u8]) -> KilnResult<Option<usize>> {
        let mut io = FdIo(fd);
        loop {
            match self.session.reader().read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            match self.session.read_tls(&mut io) {
                Ok(0) => return Ok(Some(0)),
                Ok(_) => {
                    self.session
                        .process_new_packets()
                        .map_err(|e| KilnError::Tls(e.to_string()))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Encrypt plaintext into the session's outbound buffer. The caller
    /// flushes with `flush_tls`.
    pub fn write_plain(&mut self, buf: &[u8]) -> KilnResult<usize> {
        let n = self
            .session
            .writer()
            .write(buf)
            .map_err(|e| KilnError::Tls(e.to_string()))?;
        Ok(n)
    }

    /// Push buffered TLS bytes to the socket. Ok(true) when fully flushed;
    /// Ok(false) when the socket would block.
    pub fn flush_tls(&mut self, fd: i32) -> KilnResult<bool> {
        let mut io = FdIo(fd);
        while self.session.wants_write() {
            match self.session.write_tls(&mut io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Queue the close_notify alert.
    pub fn send_close_notify(&mut self, fd: i32) {
        self.session.send_close_notify();
        let _ = self.flush_tls(fd);
    }
}

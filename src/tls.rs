// TLS session state machine over rustls, pull/push style.
// Numan Thabit 2026

use std::{io, sync::Arc, sync::Once};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    server::WebPkiClientVerifier,
    ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection,
};
use tracing::debug;

use crate::error::{CertStatus, NetError};

/// Priority string accepted for configuration compatibility. The cipher
/// selection itself is governed by the TLS backend.
pub const DEFAULT_PRIORITY: &str = "NORMAL";

static PROVIDER_INIT: Once = Once::new();

/// Process-wide one-time initialization of the TLS backend.
fn ensure_provider() {
    PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Which end of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Client,
    Server,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    NotStarted,
    Handshaking,
    Active,
    Closed,
}

/// Result of driving the handshake one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The handshake finished; the pipeline now encrypts.
    Done,
    /// More inbound bytes are needed; re-arm the readable direction.
    WantRead,
    /// Outbound records are queued; re-arm the writable direction.
    WantWrite,
}

/// Result of a plaintext read through the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRead {
    Data(usize),
    WouldBlock,
    Closed,
}

/// Credential set handed to sessions: certificate chain, private key, trust
/// roots. Imported as opaque DER blobs.
pub struct TlsCredentials {
    certs: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
    roots: RootCertStore,
    require_peer_cert: bool,
    priority: String,
}

impl TlsCredentials {
    /// Creates an empty credential set with the default priority string.
    pub fn new() -> Self {
        ensure_provider();
        Self {
            certs: Vec::new(),
            key: None,
            roots: RootCertStore::empty(),
            require_peer_cert: false,
            priority: DEFAULT_PRIORITY.to_string(),
        }
    }

    /// Imports an own-certificate chain plus private key, both DER.
    pub fn set_cert_key_der(
        &mut self,
        chain: Vec<Vec<u8>>,
        key: Vec<u8>,
    ) -> Result<(), NetError> {
        self.certs = chain.into_iter().map(CertificateDer::from).collect();
        let key = PrivateKeyDer::try_from(key)
            .map_err(|err| NetError::TlsHandshake(format!("bad private key: {err}")))?;
        self.key = Some(key);
        Ok(())
    }

    /// Adds one trusted root certificate, DER.
    pub fn add_root_der(&mut self, der: Vec<u8>) -> Result<(), NetError> {
        self.roots
            .add(CertificateDer::from(der))
            .map_err(|err| NetError::TlsHandshake(format!("bad root certificate: {err}")))?;
        Ok(())
    }

    /// Requires the remote end to present a valid certificate.
    pub fn set_require_peer_cert(&mut self, required: bool) {
        self.require_peer_cert = required;
    }

    /// Returns whether a peer certificate is demanded.
    pub fn require_peer_cert(&self) -> bool {
        self.require_peer_cert
    }

    /// Overrides the priority string.
    pub fn set_priority(&mut self, priority: &str) {
        self.priority = priority.to_string();
    }

    /// Returns the configured priority string.
    pub fn priority(&self) -> &str {
        &self.priority
    }

    fn client_config(&self) -> Result<ClientConfig, NetError> {
        let builder = ClientConfig::builder().with_root_certificates(self.roots.clone());
        let config = match (&self.key, self.certs.is_empty()) {
            (Some(key), false) => builder
                .with_client_auth_cert(self.certs.clone(), key.clone_key())
                .map_err(|err| NetError::TlsHandshake(err.to_string()))?,
            _ => builder.with_no_client_auth(),
        };
        Ok(config)
    }

    fn server_config(&self) -> Result<ServerConfig, NetError> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| NetError::TlsHandshake("server requires a certificate".into()))?;
        let builder = if self.require_peer_cert {
            let verifier = WebPkiClientVerifier::builder(Arc::new(self.roots.clone()))
                .build()
                .map_err(|err| NetError::TlsHandshake(err.to_string()))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            ServerConfig::builder().with_no_client_auth()
        };
        builder
            .with_single_cert(self.certs.clone(), key.clone_key())
            .map_err(|err| NetError::TlsHandshake(err.to_string()))
    }
}

impl Default for TlsCredentials {
    fn default() -> Self {
        Self::new()
    }
}

/// One TLS session bound to a socket's stream pipeline.
///
/// The session never touches the descriptor itself: all record I/O goes
/// through the reader/writer the pipeline passes in, and "needs more bytes"
/// surfaces as [`HandshakeStatus::WantRead`]/[`HandshakeStatus::WantWrite`]
/// so the socket can re-arm exactly that direction.
pub struct TlsSession {
    conn: Connection,
    mode: TlsMode,
    state: TlsState,
    write_closed: bool,
}

impl TlsSession {
    /// Creates a client-mode session targeting `server_name`.
    pub fn client(creds: &TlsCredentials, server_name: &str) -> Result<Self, NetError> {
        ensure_provider();
        let config = Arc::new(creds.client_config()?);
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| NetError::InvalidAddress(server_name.to_string()))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|err| NetError::TlsHandshake(err.to_string()))?;
        Ok(Self {
            conn: Connection::Client(conn),
            mode: TlsMode::Client,
            state: TlsState::NotStarted,
            write_closed: false,
        })
    }

    /// Creates a server-mode session.
    pub fn server(creds: &TlsCredentials) -> Result<Self, NetError> {
        ensure_provider();
        let config = Arc::new(creds.server_config()?);
        let conn = ServerConnection::new(config)
            .map_err(|err| NetError::TlsHandshake(err.to_string()))?;
        Ok(Self {
            conn: Connection::Server(conn),
            mode: TlsMode::Server,
            state: TlsState::NotStarted,
            write_closed: false,
        })
    }

    /// Returns the session mode.
    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> TlsState {
        self.state
    }

    /// Drives the handshake as far as the transport allows.
    ///
    /// Non-fatal exits report the direction that must become ready before
    /// the next call. Fatal TLS errors surface as `TlsHandshake` or, for
    /// certificate rejections, `TlsPeerInvalid` with the status mask.
    pub fn handshake<IO>(&mut self, io: &mut IO) -> Result<HandshakeStatus, NetError>
    where
        IO: io::Read + io::Write,
    {
        if self.state == TlsState::Closed {
            return Err(NetError::Closed);
        }
        self.state = TlsState::Handshaking;

        loop {
            if self.conn.wants_write() {
                match self.conn.write_tls(io) {
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::WantWrite);
                    }
                    Err(err) => return Err(NetError::Io(err)),
                }
                continue;
            }

            if !self.conn.is_handshaking() {
                self.state = TlsState::Active;
                return Ok(HandshakeStatus::Done);
            }

            if self.conn.wants_read() {
                match self.conn.read_tls(io) {
                    Ok(0) => return Err(NetError::Closed),
                    Ok(_) => {
                        self.process_packets()?;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::WantRead);
                    }
                    Err(err) => return Err(NetError::Io(err)),
                }
            }
        }
    }

    fn process_packets(&mut self) -> Result<(), NetError> {
        self.conn.process_new_packets().map_err(map_tls_error)?;
        Ok(())
    }

    /// Reads plaintext through the session.
    pub fn read_plain<IO>(&mut self, io: &mut IO, buf: &mut [u8]) -> Result<TlsRead, NetError>
    where
        IO: io::Read + io::Write,
    {
        // Pull whatever ciphertext is available before consulting the
        // plaintext reader; "want more" maps to WouldBlock.
        loop {
            match self.conn.read_tls(io) {
                Ok(0) => break,
                Ok(_) => {
                    let state = self.conn.process_new_packets().map_err(map_tls_error)?;
                    if state.peer_has_closed() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(NetError::Io(err)),
            }
        }

        match io::Read::read(&mut self.conn.reader(), buf) {
            Ok(0) => Ok(TlsRead::Closed),
            Ok(n) => Ok(TlsRead::Data(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(TlsRead::WouldBlock),
            Err(err) => Err(NetError::Io(err)),
        }
    }

    /// Writes plaintext through the session, flushing produced records.
    /// Returns the number of plaintext bytes accepted.
    pub fn write_plain<IO>(&mut self, io: &mut IO, data: &[u8]) -> Result<usize, NetError>
    where
        IO: io::Read + io::Write,
    {
        if self.write_closed {
            return Err(NetError::NotWritable);
        }
        let accepted =
            io::Write::write(&mut self.conn.writer(), data).map_err(NetError::Io)?;
        self.flush_records(io)?;
        Ok(accepted)
    }

    /// Pushes pending TLS records to the transport. Returns true once no
    /// record remains buffered.
    pub fn flush_records<IO>(&mut self, io: &mut IO) -> Result<bool, NetError>
    where
        IO: io::Read + io::Write,
    {
        while self.conn.wants_write() {
            match self.conn.write_tls(io) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(NetError::Io(err)),
            }
        }
        Ok(true)
    }

    /// Sends the TLS close alert with read-write semantics: after this the
    /// session neither reads nor writes application data.
    pub fn close<IO>(&mut self, io: &mut IO) -> Result<(), NetError>
    where
        IO: io::Read + io::Write,
    {
        if self.state != TlsState::Closed {
            self.conn.send_close_notify();
            self.write_closed = true;
            self.state = TlsState::Closed;
            let _ = self.flush_records(io)?;
        }
        Ok(())
    }

    /// Closes only the write direction; inbound plaintext keeps flowing.
    pub fn shutdown_write<IO>(&mut self, io: &mut IO) -> Result<(), NetError>
    where
        IO: io::Read + io::Write,
    {
        if !self.write_closed {
            self.conn.send_close_notify();
            self.write_closed = true;
            let _ = self.flush_records(io)?;
        }
        Ok(())
    }

    /// Returns true when the write direction was shut down.
    pub fn write_closed(&self) -> bool {
        self.write_closed
    }

    /// Returns true when the peer presented at least one certificate.
    pub fn has_peer_cert(&self) -> bool {
        self.conn
            .peer_certificates()
            .map(|certs| !certs.is_empty())
            .unwrap_or(false)
    }
}

fn map_tls_error(err: rustls::Error) -> NetError {
    use rustls::CertificateError;

    match err {
        rustls::Error::NoCertificatesPresented => {
            NetError::TlsPeerInvalid(CertStatus::NO_CERT)
        }
        rustls::Error::InvalidCertificate(cert_err) => {
            let status = match cert_err {
                CertificateError::Expired => CertStatus::EXPIRED,
                CertificateError::NotValidYet => CertStatus::NOT_YET_ACTIVATED,
                CertificateError::Revoked => CertStatus::REVOKED,
                CertificateError::UnknownIssuer => CertStatus::SIGNER_NOT_FOUND,
                CertificateError::BadSignature => CertStatus::INVALID,
                _ => CertStatus::INVALID,
            };
            NetError::TlsPeerInvalid(status)
        }
        other => {
            debug!(error = %other, "fatal tls failure");
            NetError::TlsHandshake(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory transport: reads from `inbound`, writes to `outbound`,
    /// reporting WouldBlock when the inbound buffer runs dry.
    #[derive(Default)]
    struct MemIo {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
    }

    impl io::Read for MemIo {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "dry"));
            }
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().expect("byte");
            }
            Ok(n)
        }
    }

    impl io::Write for MemIo {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn client_session() -> TlsSession {
        let creds = TlsCredentials::new();
        TlsSession::client(&creds, "localhost").expect("client session")
    }

    #[test]
    fn default_priority_is_normal() {
        let creds = TlsCredentials::new();
        assert_eq!(creds.priority(), "NORMAL");
        assert!(!creds.require_peer_cert());
    }

    #[test]
    fn server_without_certificate_is_rejected() {
        let creds = TlsCredentials::new();
        assert!(matches!(
            TlsSession::server(&creds),
            Err(NetError::TlsHandshake(_))
        ));
    }

    #[test]
    fn client_hello_flushes_then_wants_read() {
        let mut session = client_session();
        assert_eq!(session.state(), TlsState::NotStarted);
        assert_eq!(session.mode(), TlsMode::Client);

        let mut io = MemIo::default();
        let status = session.handshake(&mut io).expect("handshake step");
        // The first flight went out; the session now waits for the server.
        assert_eq!(status, HandshakeStatus::WantRead);
        assert!(!io.outbound.is_empty());
        assert_eq!(session.state(), TlsState::Handshaking);
    }

    #[test]
    fn handshake_after_close_is_closed_error() {
        let mut session = client_session();
        let mut io = MemIo::default();
        session.close(&mut io).expect("close");
        assert_eq!(session.state(), TlsState::Closed);
        assert!(matches!(
            session.handshake(&mut io),
            Err(NetError::Closed)
        ));
    }

    #[test]
    fn shutdown_write_keeps_session_open() {
        let mut session = client_session();
        let mut io = MemIo::default();
        session.shutdown_write(&mut io).expect("shutdown write");
        assert!(session.write_closed());
        assert_ne!(session.state(), TlsState::Closed);
        assert!(matches!(
            session.write_plain(&mut io, b"late"),
            Err(NetError::NotWritable)
        ));
    }

    #[test]
    fn certificate_errors_map_to_status_bits() {
        let err = map_tls_error(rustls::Error::InvalidCertificate(
            rustls::CertificateError::Expired,
        ));
        assert!(matches!(
            err,
            NetError::TlsPeerInvalid(status) if status.contains(CertStatus::EXPIRED)
        ));

        let err = map_tls_error(rustls::Error::NoCertificatesPresented);
        assert!(matches!(
            err,
            NetError::TlsPeerInvalid(status) if status.contains(CertStatus::NO_CERT)
        ));
    }
}

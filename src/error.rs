// Closed error taxonomy shared by every public operation.
// Numan Thabit 2026

use std::io;

use thiserror::Error;

/// Peer-certificate verification status bitmask.
///
/// Individual conditions are OR-ed together; [`CertStatus::OK`] is the empty
/// mask. A session configured to require a peer certificate fails its
/// handshake with [`NetError::TlsPeerInvalid`] carrying the observed mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CertStatus(pub u32);

impl CertStatus {
    /// No problem found with the peer certificate.
    pub const OK: CertStatus = CertStatus(0);
    /// The peer presented no certificate at all.
    pub const NO_CERT: CertStatus = CertStatus(1 << 0);
    /// The certificate failed signature or structural validation.
    pub const INVALID: CertStatus = CertStatus(1 << 1);
    /// The certificate has been revoked.
    pub const REVOKED: CertStatus = CertStatus(1 << 2);
    /// The signing authority is not known.
    pub const SIGNER_NOT_FOUND: CertStatus = CertStatus(1 << 3);
    /// The signer is not a certificate authority.
    pub const SIGNER_NOT_CA: CertStatus = CertStatus(1 << 4);
    /// The certificate uses an algorithm considered insecure.
    pub const INSECURE_ALG: CertStatus = CertStatus(1 << 5);
    /// The certificate validity period has ended.
    pub const EXPIRED: CertStatus = CertStatus(1 << 6);
    /// The certificate validity period has not started yet.
    pub const NOT_YET_ACTIVATED: CertStatus = CertStatus(1 << 7);

    /// Returns true when the mask carries no failure bits.
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Returns true when every bit of `other` is present in `self`.
    pub fn contains(self, other: CertStatus) -> bool {
        self.0 & other.0 == other.0
    }

    /// Merges two status masks.
    pub fn union(self, other: CertStatus) -> CertStatus {
        CertStatus(self.0 | other.0)
    }
}

/// Errors surfaced by the socket substrate and the layers above it.
///
/// "Would block" is deliberately absent: readiness exhaustion is handled
/// internally by re-arming the reactor and never reaches callers.
#[derive(Debug, Error)]
pub enum NetError {
    /// The textual address could not be parsed or matched no usable family.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The socket is not in a state that allows the operation.
    #[error("socket is not connected")]
    NotConnected,

    /// The operation was already started on this socket.
    #[error("operation already active")]
    AlreadyActive,

    /// Name resolution failed.
    #[error("failed to resolve address '{0}'")]
    ResolveFailure(String),

    /// The remote end refused the connection.
    #[error("connection refused")]
    ConnectRefused,

    /// The connect timeout elapsed before the connection was established.
    #[error("connect timed out")]
    ConnectTimeout,

    /// Accepting an incoming connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] io::Error),

    /// The stream cannot be read in its current configuration.
    #[error("stream is not readable")]
    NotReadable,

    /// The stream cannot be written in its current configuration.
    #[error("stream is not writable")]
    NotWritable,

    /// The TLS handshake failed fatally.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    /// The peer certificate was rejected.
    #[error("peer certificate rejected: {0:?}")]
    TlsPeerInvalid(CertStatus),

    /// A peer violated the framing or message protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The socket, peer, or session is closed.
    #[error("closed")]
    Closed,

    /// An OS-level I/O failure that maps to no richer variant.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Collapses an OS error observed during `connect` into the taxonomy.
    pub fn from_connect_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => NetError::ConnectRefused,
            io::ErrorKind::TimedOut => NetError::ConnectTimeout,
            _ => NetError::Io(err),
        }
    }
}

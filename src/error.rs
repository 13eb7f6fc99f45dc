//! Crate-wide error and result types.

use std::fmt;

use tokio::sync::mpsc;

/// The result type used by the crate unless a subsystem defines its own.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type used by all components of the engine.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A network or disk IO failure.
    Io(std::io::Error),
    /// The torrent metainfo could not be parsed.
    InvalidMetainfo,
    /// The magnet URI is malformed or doesn't carry a v1 info hash.
    InvalidMagnet,
    /// The magnet's info dict is not cached in the session store, and
    /// metadata exchange with peers is not part of the core.
    MetadataUnavailable,
    /// The torrent with this info hash is already managed by the engine.
    AlreadyAdded,
    /// The torrent id doesn't refer to a torrent known to the engine.
    InvalidTorrentId,
    /// A piece index was out of bounds for the torrent.
    InvalidPieceIndex,
    /// The info hash a peer advertised in its handshake doesn't match ours.
    InvalidPeerInfoHash,
    /// The peer violated the wire protocol. The message names the violation.
    ProtocolViolation(&'static str),
    /// The peer sent nothing within the handshake timeout.
    HandshakeTimeout,
    /// The peer was idle past the connection timeout.
    PeerIdle,
    /// A channel between engine components was unexpectedly closed. This
    /// usually means another component panicked or was shut down early.
    Channel,
    /// Persisted resume state could not be decoded.
    InvalidResumeState,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidMetainfo => write!(f, "invalid metainfo"),
            Error::InvalidMagnet => write!(f, "invalid magnet URI"),
            Error::MetadataUnavailable => {
                write!(f, "torrent metadata not available")
            }
            Error::AlreadyAdded => write!(f, "torrent already added"),
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Error::ProtocolViolation(what) => {
                write!(f, "peer protocol violation: {}", what)
            }
            Error::HandshakeTimeout => write!(f, "peer handshake timed out"),
            Error::PeerIdle => write!(f, "peer connection idle timeout"),
            Error::Channel => write!(f, "engine channel closed"),
            Error::InvalidResumeState => {
                write!(f, "invalid persisted resume state")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

// A send can only fail because the receiver half was dropped, which loses the
// payload anyway, so the payload type is erased here.
impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Channel
    }
}

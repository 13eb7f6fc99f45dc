//! Error types of the disk task.

use std::fmt;

pub(crate) type Result<T> = std::result::Result<T, DiskError>;

/// Failure to set up a torrent's files on disk.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// The torrent is already allocated in the disk task.
    AlreadyExists,
    /// Creating directories or opening files failed.
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "torrent allocation IO error: {}", e),
        }
    }
}

impl From<std::io::Error> for NewTorrentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure of the disk task's own machinery (as opposed to per-operation
/// results, which are reported through torrent alerts).
#[derive(Debug)]
pub(crate) enum DiskError {
    /// A command referred to a torrent the disk task doesn't know.
    InvalidTorrentId,
    /// An alert or command channel was dropped.
    Channel,
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::Channel => write!(f, "disk channel closed"),
        }
    }
}

impl std::error::Error for DiskError {}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DiskError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

/// Why a block read for the upload path failed.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The block's piece index or offset is out of bounds.
    InvalidBlock,
    /// The underlying file doesn't have the data (yet).
    MissingData,
    /// The filesystem failed.
    Io(std::io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidBlock => write!(f, "invalid block"),
            Self::MissingData => write!(f, "block data not on disk"),
            Self::Io(e) => write!(f, "read error: {}", e),
        }
    }
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

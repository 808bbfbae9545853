//! Errors specific to the disk task, reported back to the torrent over the
//! alert channels rather than aborting the disk task itself.

use std::fmt;

pub(crate) type Result<T, E = crate::error::Error> = std::result::Result<T, E>;

/// Failure to allocate the on-disk layout for a new torrent.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// A torrent with this id is already registered with the disk task.
    AlreadyExists,
    /// The download path already existed, or a file/directory could not be
    /// created or opened.
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

impl From<std::io::Error> for NewTorrentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure to write a completed piece to disk.
#[derive(Debug)]
pub(crate) enum WriteError {
    /// The piece index didn't exist in this torrent.
    InvalidPieceIndex,
    /// The underlying `pwritev` call failed.
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

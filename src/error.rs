//! The error taxonomy shared by every part of the engine.
//!
//! Broad categories mirror where an error can originate: a malformed
//! metainfo file, a tracker announce, the wire protocol, a stalled peer, a
//! failed piece verification, or the disk. Finer-grained variants exist
//! where callers need to distinguish specific failure causes (e.g. an
//! invalid piece index vs. a general IO error).

use std::fmt;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// The metainfo file was malformed, had missing keys, or its piece
    /// digests weren't a multiple of 20 bytes.
    Metainfo(String),
    /// The tracker could not be reached, returned a non-200 response, or its
    /// reply was not a valid bencoded dictionary, and no peers were ever
    /// obtained to fall back on.
    Tracker(String),
    /// Every known peer disconnected (or was never reachable) before the
    /// torrent finished downloading.
    SwarmExhausted,
    /// A wire protocol violation: bad handshake, oversize message, or
    /// message received out of the expected sequence.
    Wire(WireError),
    /// A peer failed to respond to an outstanding request in time.
    PeerTimeout,
    /// A piece failed SHA-1 verification against its metainfo digest.
    Verification,
    /// Filesystem or socket IO failure.
    Io(std::io::Error),
    /// The peer's handshake declared a different info hash than ours.
    InvalidPeerInfoHash,
    /// A bitfield message arrived outside of the availability exchange
    /// window.
    BitfieldNotAfterHandshake,
    /// A piece index was out of bounds for the torrent.
    InvalidPieceIndex,
    /// A disk command referred to an unknown torrent id.
    InvalidTorrentId,
}

/// Wire-level protocol violations, detected by the framer or peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The remote's handshake protocol string or info hash didn't match.
    HandshakeMismatch,
    /// A message's declared length exceeded [`crate::MAX_MSG_LEN`].
    OversizeMessage,
    /// A message arrived that is not legal in the session's current state
    /// (e.g. a second bitfield message, or spare bitfield bits set).
    ProtocolSequence,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metainfo(msg) => write!(f, "malformed metainfo: {}", msg),
            Self::Tracker(msg) => write!(f, "tracker error: {}", msg),
            Self::SwarmExhausted => {
                write!(f, "no peers left and torrent is incomplete")
            }
            Self::Wire(e) => write!(f, "wire protocol error: {}", e),
            Self::PeerTimeout => write!(f, "peer timed out"),
            Self::Verification => write!(f, "piece failed verification"),
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Self::BitfieldNotAfterHandshake => {
                write!(f, "bitfield message sent outside of availability exchange")
            }
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeMismatch => write!(f, "handshake mismatch"),
            Self::OversizeMessage => write!(f, "oversize message"),
            Self::ProtocolSequence => write!(f, "message out of sequence"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Metainfo(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Tracker(e.to_string())
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Self::PeerTimeout
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "internal channel closed",
        ))
    }
}

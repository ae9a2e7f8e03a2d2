//! Crate-wide error types.
//!
//! Errors are scoped per §7 of the design: a [`PeerError`](Error::PeerError)
//! never propagates beyond the peer session that raised it, a
//! [`HashMismatch`](Error::HashMismatch) never propagates beyond the piece it
//! concerns, and only [`Fatal`](Error::Fatal) is meant to reach the caller of
//! the engine's public API.

use std::fmt;

use crate::PieceIndex;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The top-level error type for the engine.
#[derive(Debug)]
pub enum Error {
    /// An I/O or protocol failure scoped to a single peer session.
    PeerError(String),
    /// A message with an unrecognized id was received from a peer.
    UnknownMessage { id: u8, payload_len: usize },
    /// A piece failed SHA-1 verification.
    HashMismatch { index: PieceIndex },
    /// A disk write failed. The piece remains pending a retry.
    IoError(std::io::Error),
    /// A piece index fell outside `0..piece_count`.
    InvalidPieceIndex,
    /// Configuration is invalid, or an invariant was violated at startup.
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerError(msg) => write!(f, "peer error: {}", msg),
            Self::UnknownMessage { id, payload_len } => write!(
                f,
                "unknown message id {} with {} byte payload",
                id, payload_len
            ),
            Self::HashMismatch { index } => {
                write!(f, "piece {} failed hash verification", index)
            }
            Self::IoError(e) => write!(f, "io error: {}", e),
            Self::InvalidPieceIndex => write!(f, "piece index out of bounds"),
            Self::Fatal(msg) => write!(f, "fatal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Fatal(format!("bencode error: {}", e))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::PeerError(format!("channel closed: {}", e))
    }
}

/// A peer-session-scoped error.
///
/// Kept distinct from [`Error`] so that the swarm's reader loop can
/// pattern-match specifically on session failures without needing to handle
/// the engine-wide variants, mirroring the teacher's practice of giving each
/// subsystem its own narrow error surface.
#[derive(Debug)]
pub struct PeerError(pub String);

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PeerError {}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<PeerError> for Error {
    fn from(e: PeerError) -> Self {
        Self::PeerError(e.0)
    }
}

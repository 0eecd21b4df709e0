//! Error type shared by the parser, player and engine.

use thiserror::Error;

/// Errors surfaced by fallible player operations.
///
/// Only conditions that abort an operation become an `Err`; recoverable
/// parse problems (truncated tracks, bad running status, out-of-range
/// tempo metas) are handled in-stream and never reach the caller.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// The file does not start with a valid `MThd` header, declares a
    /// header length other than 6, or carries a zero/SMPTE division.
    #[error("not a valid standard MIDI file")]
    BadHeader,

    /// SMF format 2 (and anything above) is not supported.
    #[error("unsupported SMF format {0}")]
    UnsupportedFormat(u16),

    /// An operation that needs a loaded file was called without one.
    #[error("no MIDI file loaded")]
    NoFile,

    /// An underlying read or seek failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    pub(crate) fn io(message: &str) -> Self {
        Self::Io(std::io::Error::new(std::io::ErrorKind::Other, message.to_string()))
    }
}

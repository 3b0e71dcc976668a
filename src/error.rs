//! Library error taxonomy.
//!
//! Recoverable conditions (transport drops, single bad units) are handled
//! locally by the owning component and only summarized upward; the
//! variants here are what crosses the public API boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Connect/read failures on the input or output transport.
    /// Recoverable: drives the reconnect/backoff machinery.
    #[error("transport error: {0}")]
    Transport(String),

    /// Decode/encode/mux failure for one unit.
    #[error("codec error: {0}")]
    Codec(String),

    /// No unit arrived within the configured stall window.
    #[error("stream stalled: {0}")]
    Stalled(String),

    /// Reconnect attempts exhausted without a successful open.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    Exhausted { attempts: u32 },

    /// Operation referenced a handle that is not registered.
    #[error("invalid handle {0}")]
    InvalidHandle(u32),

    /// Operation on a component that already stopped.
    #[error("component is closed")]
    Closed,

    /// Caller violated an API precondition; reported, never a panic.
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Error surfaced by the media library.
    #[error("media library error: {0}")]
    Media(#[from] ac_ffmpeg::Error),
}

/// Coarse error class carried by error events so hosts can route
/// failures without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Codec,
    Stall,
    Exhausted,
    Precondition,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Transport(_) | RelayError::Io(_) => ErrorKind::Transport,
            RelayError::Codec(_) | RelayError::Media(_) => ErrorKind::Codec,
            RelayError::Stalled(_) => ErrorKind::Stall,
            RelayError::Exhausted { .. } => ErrorKind::Exhausted,
            RelayError::InvalidHandle(_) | RelayError::Closed | RelayError::Precondition(_) => {
                ErrorKind::Precondition
            }
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Codec => "codec",
            ErrorKind::Stall => "stall",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Precondition => "precondition",
        };
        write!(f, "{name}")
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

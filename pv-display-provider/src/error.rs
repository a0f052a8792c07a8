use pv_display_protocol::ProtocolError;
use pv_display_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by control sessions and display sessions, as a typed enum
/// rather than an integer code.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("channel not found or already closed")]
    NotFound,

    #[error("resource temporarily unavailable, try again")]
    TryAgain,
}

impl SessionError {
    /// True for errors that are terminal for the owning display or session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport(_) | SessionError::Protocol(_))
    }
}

use pv_display_protocol::ProtocolError;
use pv_display_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the consumer's control session and display backends,
/// as a typed enum.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("channel not found or already closed")]
    NotFound,
}

impl SessionError {
    /// True for errors that are terminal for the owning backend or session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport(_) | SessionError::Protocol(_))
    }
}

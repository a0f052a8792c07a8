use thiserror::Error;

/// Failures surfaced by the IVC channel adapter boundary.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("operation would block")]
    WouldBlock,

    #[error("insufficient space: needed {needed} bytes, {available} available")]
    ResourceExhausted { needed: usize, available: usize },

    #[error("channel not found or already closed")]
    NotFound,

    #[error("peer disconnected")]
    Disconnected,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("underlying transport error: {0}")]
    Io(String),
}

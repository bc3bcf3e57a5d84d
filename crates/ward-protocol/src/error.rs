use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the stream before the expected frame arrived.
    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

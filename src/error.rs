use std::time::Duration;

/// Errors surfaced across the public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("packet is malformed: {0}")]
    MalformedPacket(#[from] crate::codec::MalformedPacket),

    #[error("sender window is full")]
    WindowFull,

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("substrate I/O error: {0}")]
    Substrate(#[from] std::io::Error),

    #[error("connection is not established")]
    NotEstablished,
}

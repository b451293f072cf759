//! Handshake/teardown state machine.

/// Which side of the handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// A connection progresses through these states over its lifetime.
///
/// - `Closed`: no handshake in progress; the fictional starting/ending state.
/// - `SynSent`: initiator has sent SYN, waiting for SYN|ACK.
/// - `SynRcvd`: responder has sent SYN|ACK, waiting for the final ACK.
/// - `Established`: open connection; data may flow in both directions.
/// - `Closing`: a FIN has been sent; waiting for resources to be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Closed,
    SynSent,
    SynRcvd,
    Established,
    Closing,
}

impl ConnectionState {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }
}

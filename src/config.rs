use std::time::Duration;

use crate::loss::LossProfile;

/// Tunables recognized by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum in-flight unacknowledged messages the sender will admit.
    pub window_size: u16,
    /// Credit advertised to the peer.
    pub recv_win: u16,
    /// Retransmission timer duration.
    pub t_retx: Duration,
    /// Handshake deadline on the initiator.
    pub t_connect: Duration,
    /// Test-only drop model; a no-op in builds without `test-util`.
    pub loss_profile: LossProfile,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            window_size: 5,
            recv_win: 10,
            t_retx: Duration::from_millis(500),
            t_connect: Duration::from_secs(5),
            loss_profile: LossProfile::Clean,
        }
    }
}

//! A reliable, ordered, Go-Back-N transport over unreliable UDP datagrams.
//!
//! [`connection::Connection`] is the single-endpoint model: it owns its
//! socket and runs its own handshake, sender window and receiver. [`server::Server`]
//! is the shared model: one socket demultiplexed by `conn_id` across many
//! peers, with an optional room registry for group delivery.

mod codec;
mod config;
mod connection;
mod error;
mod loss;
mod metrics;
mod server;
mod state;

pub use codec::{Flags, MalformedPacket, Packet, HEADER_LEN};
pub use config::Config;
pub use connection::Connection;
pub use error::Error;
pub use loss::LossProfile;
pub use metrics::MetricsSnapshot;
pub use server::Server;
pub use state::{ConnectionState, Role};

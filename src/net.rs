//! Network endpoints and the broker-facing socket.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::{BrokerSocket, SocketError};

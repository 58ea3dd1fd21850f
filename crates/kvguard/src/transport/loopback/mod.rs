//! In-process stand-in for a Redis server.
//!
//! A [`LoopbackServer`] holds keys, sets and channel subscribers; any number
//! of [`LoopbackTransport`]s can share one, which is how tests model several
//! processes talking to the same backend. Flipping
//! [`LoopbackServer::set_available`] simulates an outage: every transport
//! loses its connection and must reconnect.

mod server;
mod transport;

pub use server::LoopbackServer;
pub use transport::LoopbackTransport;

//! Redis transport.
//!
//! Commands go through a `ConnectionManager`, publishes through a multiplexed
//! connection, and every subscription gets its own pub/sub connection.

mod error;
mod transport;

pub use transport::RedisTransport;

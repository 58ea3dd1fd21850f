//! Wire transports for the primary backend.
//!
//! - `redis` (default feature): Redis through the `redis` crate
//! - loopback: an in-process broker, used for local development and tests

pub mod loopback;

#[cfg(feature = "redis")]
pub mod redis_impl;

pub use loopback::{LoopbackServer, LoopbackTransport};

#[cfg(feature = "redis")]
pub use redis_impl::RedisTransport;

//! kvguard: a resilient cache, session and messaging substrate.
//!
//! Redis is the primary backend. When it goes away, reads and writes continue
//! against an in-process store and queued writes are replayed once Redis is
//! back. Start everything with [`KvGuard::start`].

pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod fallback;
pub mod health;
pub mod memory;
pub mod pubsub;
pub mod session;
pub mod tasks;
pub mod tiered;
pub mod transport;

#[cfg(test)]
mod testing;

pub use context::KvGuard;

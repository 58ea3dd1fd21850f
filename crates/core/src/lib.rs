//! Pure building blocks of the kvguard substrate.
//!
//! Everything here is free of I/O: error and key types, the wire command
//! model and [`connection::Transport`] seam, the compression envelope, the
//! fallback state machine, session and message types, and health
//! aggregation. The `kvguard` crate wires them to real backends.

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod fallback;
pub mod health;
pub mod pubsub;
pub mod session;

pub use config::StoreConfig;
pub use error::{KvError, Result};
pub use events::BackendEvent;

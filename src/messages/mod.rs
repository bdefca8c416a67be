//! Durable storage for messages.
//!
//! Messages are written to an append-only log that is replayed into memory
//! when a store opens.

mod log;

pub use log::MessageLog;

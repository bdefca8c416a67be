//! # notesync
//!
//! A realtime, append-only notes service. Clients subscribe to a single
//! shared list of short text messages and receive the full list whenever
//! it changes; new messages are keyed and timestamped by the service.
//!
//! ## Core Concepts
//!
//! - **Store**: the authoritative, append-only message list, optionally
//!   backed by a durable log
//! - **Subscriptions**: every subscriber gets the current snapshot on
//!   registration and a fresh one after each append
//! - **Gateway**: the validating entry point for writes
//! - **Server**: newline-delimited JSON frames over TCP
//!
//! ## Example
//!
//! ```ignore
//! use notesync::{MessageStore, StoreConfig, WriteGateway};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MessageStore::open(StoreConfig::durable("./notes"))?);
//! let gateway = WriteGateway::new(Arc::clone(&store));
//!
//! let handle = store.subscribe();
//! gateway.send("Buy milk")?;
//!
//! let first = handle.next_snapshot()?;   // empty
//! let second = handle.next_snapshot()?;  // ["Buy milk"]
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod messages;
pub mod protocol;
pub mod server;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use client::{Client, SendReply};
pub use config::{Args, ServerConfig};
pub use error::{Result, SyncError, ValidationError};
pub use gateway::{Draft, SendState, WriteGateway};
pub use ids::PushIdGenerator;
pub use messages::MessageLog;
pub use protocol::{ClientFrame, ServerFrame};
pub use server::{Server, ServerHandle};
pub use store::{MessageStore, StoreConfig};
pub use subscriptions::{
    Broadcaster, DropReason, SubscriptionConfig, SubscriptionHandle, SubscriptionId, SyncEvent,
};
pub use types::*;

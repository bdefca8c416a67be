//! Subscription system for live snapshot delivery.
//!
//! Every subscriber receives the full message list:
//! - once, immediately, when it registers
//! - again after every successful append
//!
//! Each subscriber has a bounded buffer. A subscriber that falls behind
//! skips straight to the newest snapshots, since each one supersedes the
//! last. A subscriber that drops its handle is removed without affecting
//! the others.
//!
//! # Example
//!
//! ```ignore
//! let handle = store.subscribe();
//!
//! loop {
//!     match handle.recv() {
//!         Ok(SyncEvent::Snapshot(snapshot)) => render(snapshot.newest_first()),
//!         Ok(SyncEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::Broadcaster;
pub use types::{DropReason, SubscriptionConfig, SubscriptionHandle, SubscriptionId, SyncEvent};

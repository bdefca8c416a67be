//! Subscription types for live snapshot delivery.

use crate::error::SyncError;
use crate::types::Snapshot;
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for subscriptions.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max undelivered snapshots held for a subscriber. Once full, the
    /// oldest pending snapshot is discarded for each new one.
    /// Default: 64
    pub buffer_size: usize,
}

impl SubscriptionConfig {
    pub const DEFAULT_BUFFER_SIZE: usize = 64;
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Events delivered to a subscriber.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// The full message list after a change (or at registration).
    Snapshot(Snapshot),

    /// The subscription ended on the service side.
    Dropped { reason: DropReason },
}

/// Why a subscription was ended by the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The store is shutting down.
    Shutdown,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a subscription.
///
/// Once the subscription is removed the channel disconnects and the
/// receive methods return errors after any buffered events are drained.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: Receiver<SyncEvent>,
    /// Dropped with the handle; tells the broadcaster the subscriber left.
    pub(super) _alive: Arc<()>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<SyncEvent, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<SyncEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<SyncEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Block for the next snapshot.
    ///
    /// A `Dropped` event or a disconnected channel is reported as
    /// [`SyncError::ChannelClosed`].
    pub fn next_snapshot(&self) -> Result<Snapshot, SyncError> {
        match self.receiver.recv() {
            Ok(SyncEvent::Snapshot(snapshot)) => Ok(snapshot),
            Ok(SyncEvent::Dropped { .. }) | Err(_) => Err(SyncError::ChannelClosed),
        }
    }
}

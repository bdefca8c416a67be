//! Subscription registry and snapshot broadcaster.

use crate::types::Snapshot;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use super::types::{DropReason, SubscriptionConfig, SubscriptionHandle, SubscriptionId, SyncEvent};

/// Internal subscription state.
struct Subscription {
    sender: Sender<SyncEvent>,
    /// Second receiver on the same channel, used to discard stale
    /// snapshots when the subscriber falls behind.
    backlog: Receiver<SyncEvent>,
    /// Gone once the handle is dropped.
    alive: Weak<()>,
    /// Snapshots delivered so far.
    delivered: u64,
    /// Stale snapshots discarded to make room for newer ones.
    coalesced: u64,
}

impl Subscription {
    fn is_connected(&self) -> bool {
        self.alive.strong_count() > 0
    }

    /// Deliver a snapshot. When the buffer is full the oldest pending
    /// snapshots are discarded: each one is superseded by the next.
    ///
    /// Returns false if the subscriber is gone.
    fn deliver(&mut self, snapshot: &Snapshot) -> bool {
        let mut event = SyncEvent::Snapshot(snapshot.clone());
        loop {
            if !self.is_connected() {
                return false;
            }
            match self.sender.try_send(event) {
                Ok(()) => {
                    self.delivered += 1;
                    return true;
                }
                Err(TrySendError::Full(rejected)) => {
                    // The subscriber may drain it concurrently; either way
                    // a slot frees up.
                    if self.backlog.try_recv().is_ok() {
                        self.coalesced += 1;
                    }
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

/// Registers subscribers and pushes snapshots to them.
///
/// The broadcaster does not order snapshots itself: callers must issue
/// [`register`](Self::register) and [`broadcast`](Self::broadcast) from
/// under the same lock that serializes store mutations.
pub struct Broadcaster {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    config: SubscriptionConfig,
}

impl Broadcaster {
    pub fn new(config: SubscriptionConfig) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Register a subscriber and deliver `initial` to it.
    ///
    /// The initial snapshot always fits: the channel is fresh.
    pub fn register(&self, initial: Snapshot) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.config.buffer_size.max(1));
        let alive = Arc::new(());

        let mut subscription = Subscription {
            sender,
            backlog: receiver.clone(),
            alive: Arc::downgrade(&alive),
            delivered: 0,
            coalesced: 0,
        };
        subscription.deliver(&initial);

        self.subscriptions.write().insert(id, subscription);
        debug!(subscription = id.0, version = initial.version.0, "subscriber registered");

        SubscriptionHandle {
            id,
            receiver,
            _alive: alive,
        }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    ///
    /// Dropping the sender disconnects the handle once it is drained.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.write().remove(&id) {
            Some(sub) => {
                debug!(
                    subscription = id.0,
                    delivered = sub.delivered,
                    coalesced = sub.coalesced,
                    "subscriber removed"
                );
                true
            }
            None => false,
        }
    }

    /// Deliver a snapshot to every subscriber.
    ///
    /// A subscriber that has fallen behind keeps only its newest pending
    /// snapshots. Subscribers whose handle is gone are removed.
    /// Returns the number of subscribers that received it.
    pub fn broadcast(&self, snapshot: &Snapshot) -> usize {
        let mut subs = self.subscriptions.write();
        let before = subs.len();

        subs.retain(|id, sub| {
            let before = sub.coalesced;
            if !sub.deliver(snapshot) {
                debug!(
                    subscription = id.0,
                    version = snapshot.version.0,
                    "dropping disconnected subscriber"
                );
                return false;
            }
            if sub.coalesced > before {
                trace!(
                    subscription = id.0,
                    version = snapshot.version.0,
                    "subscriber behind, discarded stale snapshot"
                );
            }
            true
        });

        if subs.len() < before {
            debug!(removed = before - subs.len(), "pruned subscribers");
        }
        subs.len()
    }

    /// Remove every subscriber, telling each one why (best effort).
    pub fn close_all(&self, reason: DropReason) -> usize {
        let drained: Vec<_> = self.subscriptions.write().drain().collect();
        for (_, sub) in &drained {
            let mut event = SyncEvent::Dropped { reason };
            while let Err(TrySendError::Full(rejected)) = sub.sender.try_send(event) {
                // Pending snapshots are moot once the subscription ends.
                let _ = sub.backlog.try_recv();
                event = rejected;
            }
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), ?reason, "closed all subscriptions");
        }
        drained.len()
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.subscriptions.read().contains_key(&id)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(SubscriptionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, MessageId, Timestamp, Version};
    use std::time::Duration;

    fn snapshot(n: u64) -> Snapshot {
        let messages = (1..=n)
            .map(|i| Message {
                id: MessageId(format!("m{}", i)),
                text: format!("text {}", i),
                timestamp: Timestamp(i as i64),
            })
            .collect();
        Snapshot::new(Version(n), messages)
    }

    fn expect_snapshot(handle: &SubscriptionHandle) -> Snapshot {
        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            SyncEvent::Snapshot(s) => s,
            other => panic!("Expected Snapshot event, got {:?}", other),
        }
    }

    #[test]
    fn test_register_delivers_initial_snapshot() {
        let broadcaster = Broadcaster::default();
        let handle = broadcaster.register(snapshot(0));

        let first = expect_snapshot(&handle);
        assert!(first.is_empty());
        assert_eq!(broadcaster.subscription_count(), 1);
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let broadcaster = Broadcaster::default();
        let handle = broadcaster.register(snapshot(0));

        assert!(broadcaster.unsubscribe(handle.id));
        assert!(!broadcaster.unsubscribe(handle.id));
        assert_eq!(broadcaster.subscription_count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_all() {
        let broadcaster = Broadcaster::default();
        let a = broadcaster.register(snapshot(0));
        let b = broadcaster.register(snapshot(0));
        expect_snapshot(&a);
        expect_snapshot(&b);

        assert_eq!(broadcaster.broadcast(&snapshot(1)), 2);
        assert_eq!(expect_snapshot(&a).version, Version(1));
        assert_eq!(expect_snapshot(&b).version, Version(1));
    }

    #[test]
    fn test_no_delivery_after_unsubscribe() {
        let broadcaster = Broadcaster::default();
        let handle = broadcaster.register(snapshot(0));
        expect_snapshot(&handle);

        broadcaster.unsubscribe(handle.id);
        broadcaster.broadcast(&snapshot(1));

        // Disconnected, not merely empty
        assert!(matches!(
            handle.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_drop_disconnected_subscriber() {
        let broadcaster = Broadcaster::default();
        let gone = broadcaster.register(snapshot(0));
        let stays = broadcaster.register(snapshot(0));
        drop(gone);

        assert_eq!(broadcaster.broadcast(&snapshot(1)), 1);
        assert_eq!(broadcaster.subscription_count(), 1);
        assert!(broadcaster.is_subscribed(stays.id));
    }

    #[test]
    fn test_slow_subscriber_keeps_latest() {
        let broadcaster = Broadcaster::new(SubscriptionConfig { buffer_size: 2 });
        let slow = broadcaster.register(snapshot(0));

        for n in 1..=5 {
            assert_eq!(broadcaster.broadcast(&snapshot(n)), 1);
        }

        assert!(broadcaster.is_subscribed(slow.id));
        assert_eq!(expect_snapshot(&slow).version, Version(4));
        assert_eq!(expect_snapshot(&slow).version, Version(5));
        assert!(matches!(
            slow.try_recv(),
            Err(crossbeam_channel::TryRecvError::Empty)
        ));

        broadcaster.broadcast(&snapshot(6));
        assert_eq!(expect_snapshot(&slow).version, Version(6));
    }

    #[test]
    fn test_close_all_reaches_full_buffer() {
        let broadcaster = Broadcaster::new(SubscriptionConfig { buffer_size: 1 });
        let handle = broadcaster.register(snapshot(0));
        broadcaster.broadcast(&snapshot(1));

        broadcaster.close_all(DropReason::Shutdown);
        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            SyncEvent::Dropped { reason } => assert_eq!(reason, DropReason::Shutdown),
            other => panic!("Expected Dropped event, got {:?}", other),
        }
        assert!(handle.recv().is_err());
    }

    #[test]
    fn test_close_all() {
        let broadcaster = Broadcaster::default();
        let handle = broadcaster.register(snapshot(0));
        expect_snapshot(&handle);

        assert_eq!(broadcaster.close_all(DropReason::Shutdown), 1);
        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            SyncEvent::Dropped { reason } => assert_eq!(reason, DropReason::Shutdown),
            other => panic!("Expected Dropped event, got {:?}", other),
        }
        assert!(handle.recv().is_err());
    }
}

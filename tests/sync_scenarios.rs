//! End-to-end behaviour of the store, broadcaster and gateway in-process.

use notesync::{
    MessageStore, Snapshot, SubscriptionHandle, SyncError, SyncEvent, ValidationError, Version,
    WriteGateway,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn setup() -> (Arc<MessageStore>, WriteGateway) {
    let store = Arc::new(MessageStore::in_memory());
    let gateway = WriteGateway::new(Arc::clone(&store));
    (store, gateway)
}

fn next_snapshot(handle: &SubscriptionHandle) -> Snapshot {
    match handle.recv_timeout(Duration::from_secs(1)) {
        Ok(SyncEvent::Snapshot(snapshot)) => snapshot,
        other => panic!("Expected Snapshot event, got {:?}", other),
    }
}

fn texts(snapshot: &Snapshot) -> Vec<&str> {
    snapshot.messages().iter().map(|m| m.text.as_str()).collect()
}

// --- Scenarios ---

#[test]
fn test_two_appends_keep_insertion_order() {
    let (store, gateway) = setup();
    gateway.send("Buy milk").unwrap();
    gateway.send("Call Alice").unwrap();

    let snapshot = store.snapshot();
    assert_eq!(texts(&snapshot), vec!["Buy milk", "Call Alice"]);

    // A chat view lists newest first
    let view: Vec<_> = snapshot.newest_first().map(|m| m.text.as_str()).collect();
    assert_eq!(view, vec!["Call Alice", "Buy milk"]);
}

#[test]
fn test_blank_send_fires_no_broadcast() {
    let (store, gateway) = setup();
    let handle = store.subscribe();
    assert!(next_snapshot(&handle).is_empty());

    let result = gateway.send("   ");
    assert!(matches!(
        result,
        Err(SyncError::Validation(ValidationError::BlankText))
    ));
    assert!(store.is_empty());
    assert!(handle.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_early_and_late_subscribers() {
    let (store, gateway) = setup();

    let a = store.subscribe();
    assert_eq!(next_snapshot(&a).len(), 0);

    gateway.send("first").unwrap();
    assert_eq!(next_snapshot(&a).len(), 1);

    let b = store.subscribe();
    assert_eq!(next_snapshot(&b).len(), 1);

    gateway.send("second").unwrap();
    let from_a = next_snapshot(&a);
    let from_b = next_snapshot(&b);
    assert_eq!(from_a.len(), 2);
    assert_eq!(from_a, from_b);
}

#[test]
fn test_unsubscribed_receives_nothing_more() {
    let (store, gateway) = setup();
    let handle = store.subscribe();
    next_snapshot(&handle);

    store.unsubscribe(handle.id);
    gateway.send("after").unwrap();

    assert!(handle.recv_timeout(Duration::from_millis(50)).is_err());
    // Unsubscribing twice is harmless
    store.unsubscribe(handle.id);
    assert_eq!(store.subscription_count(), 0);
}

#[test]
fn test_writer_sees_own_message_via_broadcast() {
    let (store, gateway) = setup();
    let handle = store.subscribe();
    next_snapshot(&handle);

    let sent = gateway.send("mine").unwrap();
    let snapshot = next_snapshot(&handle);
    assert_eq!(snapshot.messages().last(), Some(&sent));
}

#[test]
fn test_dropped_handle_does_not_affect_others() {
    let (store, gateway) = setup();
    let gone = store.subscribe();
    let stays = store.subscribe();
    next_snapshot(&stays);
    drop(gone);

    gateway.send("hello").unwrap();
    assert_eq!(next_snapshot(&stays).len(), 1);
    assert_eq!(store.subscription_count(), 1);
}

#[test]
fn test_slow_subscriber_catches_up_to_latest() {
    let (store, gateway) = setup();
    let handle = store.subscribe();

    // Nobody drains the default-sized buffer while these land
    for i in 0..100 {
        gateway.send(&format!("note {}", i)).unwrap();
    }
    assert_eq!(store.subscription_count(), 1);

    let mut previous = next_snapshot(&handle);
    while let Ok(SyncEvent::Snapshot(current)) = handle.try_recv() {
        assert!(current.version > previous.version);
        assert!(current.extends(&previous));
        previous = current;
    }
    assert_eq!(previous.version, Version(100));
    assert_eq!(previous, store.snapshot());

    gateway.send("after catching up").unwrap();
    assert_eq!(next_snapshot(&handle).version, Version(101));
}

// --- Concurrency ---

#[test]
fn test_concurrent_writers_monotonic_subscriber() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 25;

    let store = Arc::new(MessageStore::open(notesync::StoreConfig {
        subscription: notesync::SubscriptionConfig { buffer_size: 1024 },
        ..Default::default()
    })
    .unwrap());
    let handle = store.subscribe();

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let gateway = WriteGateway::new(Arc::clone(&store));
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    gateway.send(&format!("writer {} note {}", w, i)).unwrap();
                }
            })
        })
        .collect();

    // Subscribing mid-stream must also see a consistent, growing view
    let late = store.subscribe();

    for writer in writers {
        writer.join().unwrap();
    }

    for handle in [&handle, &late] {
        let mut previous = next_snapshot(handle);
        while previous.len() < WRITERS * PER_WRITER {
            let current = next_snapshot(handle);
            assert_eq!(current.version, previous.version.next());
            assert!(current.extends(&previous));
            previous = current;
        }
        assert_eq!(previous.version, Version((WRITERS * PER_WRITER) as u64));
    }

    let ids: Vec<_> = store.snapshot().messages().iter().map(|m| m.id.clone()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(ids, sorted, "ids are unique and sort in insertion order");
}

// --- Properties ---

fn blank() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(vec![' ', '\t', '\n', '\r']), 0..8)
        .prop_map(|chars| chars.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_valid_send_then_subscribe(text in "\\PC*[a-zA-Z0-9]\\PC*") {
        let (store, gateway) = setup();
        gateway.send(&text).unwrap();

        let handle = store.subscribe();
        let snapshot = next_snapshot(&handle);
        let matching = snapshot.messages().iter().filter(|m| m.text == text.trim()).count();
        prop_assert_eq!(matching, 1);
    }

    #[test]
    fn prop_blank_send_rejected(prefix in prop::collection::vec("[a-z]{1,8}", 0..4), text in blank()) {
        let (store, gateway) = setup();
        for p in &prefix {
            gateway.send(p).unwrap();
        }
        let before = store.snapshot();

        prop_assert!(gateway.send(&text).unwrap_err().is_validation());
        prop_assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn prop_snapshots_are_growing_prefixes(notes in prop::collection::vec("[a-z ]{0,6}", 1..20)) {
        let (store, gateway) = setup();
        let handle = store.subscribe();
        let mut previous = next_snapshot(&handle);

        for note in &notes {
            let committed = gateway.send(note).is_ok();
            if committed {
                let current = next_snapshot(&handle);
                prop_assert!(current.version > previous.version);
                prop_assert!(current.extends(&previous));
                previous = current;
            }
        }

        prop_assert_eq!(store.snapshot(), store.snapshot());
        prop_assert!(handle.try_recv().is_err());
    }
}

//! End-to-end tests for pocket-engine
//!
//! These tests drive several replicas through the public API and cover the
//! convergence, replay and rollback behavior a sync layer relies on.

use pocket_engine::{
    ChangeLog, DocumentStore, FilterOperator, LamportClock, LamportTimestamp, LwwMap,
    MemoryStore, OptimisticTracker, RemoteApply, Replica, RollbackManager, SelectiveSync,
    SyncFilter, SyncState, TieBreak, VectorClock,
};
use serde_json::json;
use std::collections::BTreeMap;

// ============================================================================
// Clock Edge Cases
// ============================================================================

#[test]
fn empty_vector_clock_roundtrip() {
    let empty = VectorClock::new();
    assert_eq!(VectorClock::parse(&empty.to_string()), empty);
}

#[test]
fn garbage_vector_clock_is_concurrent_with_nothing_seen() {
    let parsed = VectorClock::parse("%%%");
    let mut seen = VectorClock::new();
    seen.increment("a");
    assert!(parsed.is_empty());
    assert!(seen.descends(&parsed));
}

#[test]
fn lamport_receive_never_goes_backwards() {
    let mut clock = LamportClock::with_counter("a", 10);
    assert_eq!(clock.receive(3).counter, 11);
    assert_eq!(clock.receive(20).counter, 21);
}

// ============================================================================
// Merge Scenarios
// ============================================================================

#[test]
fn concurrent_delete_beats_older_set_and_replay_is_ignored() {
    let mut a: LwwMap<String> =
        LwwMap::from_state(LamportClock::with_counter("a", 4), TieBreak::NodeId, BTreeMap::new());
    let set = a.set("key", "x".to_string());
    assert_eq!(set.counter, 5);

    assert!(a.apply_remote_delete("key", LamportTimestamp::new(6, "b")));
    assert!(!a.has("key"));

    assert!(!a.apply_remote_set("key", "x".to_string(), set));
    assert!(!a.has("key"));
    assert_eq!(a.tombstone_count(), 1);
}

#[test]
fn replicas_converge_regardless_of_delivery_order() {
    let mut a = Replica::new("a");
    let mut b = Replica::new("b");
    let mut c = Replica::new("c");

    let changes = vec![
        a.insert("todos", "t1", json!({"by": "a"}), 1).unwrap(),
        b.insert("todos", "t1", json!({"by": "b"}), 1).unwrap(),
        b.insert("todos", "t2", json!({"by": "b"}), 2).unwrap(),
        a.delete("todos", "t1", 3).unwrap(),
    ];

    let mut forward = Replica::new("x");
    let mut backward = Replica::new("y");
    for change in &changes {
        forward.apply_remote(change);
    }
    for change in changes.iter().rev() {
        backward.apply_remote(change);
    }
    for change in changes.iter().chain(changes.iter()) {
        c.apply_remote(change);
    }

    assert_eq!(forward.documents("todos"), backward.documents("todos"));
    assert_eq!(forward.documents("todos"), c.documents("todos"));
}

#[test]
fn replaying_a_change_is_a_no_op() {
    let mut a = Replica::new("a");
    let mut b = Replica::new("b");
    let change = a.insert("todos", "t1", json!({"v": 1}), 1).unwrap();

    assert_eq!(b.apply_remote(&change), RemoteApply::Applied);
    let entries = |r: &Replica| r.collection("todos").unwrap().state().clone();
    let documents = b.documents("todos").len();
    let before = entries(&b);

    // The Lamport clock still advances on receive; the data does not move.
    assert_eq!(b.apply_remote(&change), RemoteApply::Ignored);
    assert_eq!(entries(&b), before);
    assert_eq!(b.documents("todos").len(), documents);
    let entry = b.collection("todos").unwrap().entry("t1").unwrap();
    assert_eq!(entry.value, Some(json!({"v": 1})));
    assert_eq!(entry.timestamp, change.stamp());
    assert!(!entry.tombstone);
}

#[test]
fn change_log_replay_from_checkpoint_zero_is_safe() {
    let mut a = Replica::new("a");
    let mut log = ChangeLog::new();
    for i in 0..5 {
        log.append(a.insert("todos", &format!("t{}", i), json!({"i": i}), i).unwrap());
    }

    let mut b = Replica::new("b");
    let page = log.since(0, 3);
    for change in &page.changes {
        b.apply_remote(change);
    }
    // Crash before the checkpoint was persisted: start over.
    for change in &log.since(0, 100).changes {
        b.apply_remote(change);
    }
    assert_eq!(b.documents("todos").len(), 5);
}

// ============================================================================
// Rollback Scenarios
// ============================================================================

#[test]
fn rejected_middle_record_rolls_back_alone() {
    let mut server = Replica::new("server");
    let mut client = Replica::new("client");
    let mut store = MemoryStore::new();
    let mut tracker = OptimisticTracker::new();

    // Both sides start with t2 at v1.
    let seeded = server.insert("todos", "t2", json!({"v": 1}), 1).unwrap();
    client.apply_remote(&seeded);
    store.put("todos", "t2", json!({"v": 1})).unwrap();

    let r1 = client.insert("todos", "t1", json!({"v": 1}), 10).unwrap();
    let r2 = client.update("todos", "t2", json!({"v": 2}), 11).unwrap();
    let r3 = client.insert("todos", "t3", json!({"v": 1}), 12).unwrap();
    let ids: Vec<_> = [r1.clone(), r2.clone(), r3.clone()]
        .into_iter()
        .map(|c| tracker.apply(&mut store, c, 10).unwrap())
        .collect();

    // The server already holds a newer t2.
    let mut server_version = None;
    for n in 0..5 {
        server_version = Some(server.update("todos", "t2", json!({"v": 100 + n}), 20).unwrap());
    }
    let server_version = server_version.unwrap();
    assert!(server_version.lamport > r2.lamport);

    for accepted in [&r1, &r3] {
        let update = tracker.find_by_change(&accepted.id()).unwrap().id.clone();
        tracker.mark_synced(&update);
    }

    assert_eq!(client.apply_remote(&server_version), RemoteApply::Applied);
    let rejected = tracker.find_by_change(&r2.id()).unwrap().id.clone();
    let result = RollbackManager::new(&mut tracker, &mut store).rollback(&rejected);

    assert_eq!(result.rolled_back, vec![ids[1].clone()]);
    assert_eq!(store.get("todos", "t2"), Some(json!({"v": 1})));
    assert_eq!(store.get("todos", "t1"), Some(json!({"v": 1})));
    assert_eq!(store.get("todos", "t3"), Some(json!({"v": 1})));
    assert_eq!(client.get("todos", "t2"), Some(&json!({"v": 104})));
    assert_eq!(tracker.get(&ids[0]).unwrap().sync_state, SyncState::Synced);
}

#[test]
fn out_of_order_requests_roll_back_newest_first() {
    let mut replica = Replica::new("a");
    let mut store = MemoryStore::new();
    let mut tracker = OptimisticTracker::new();

    let first = replica.insert("todos", "t1", json!({"v": 1}), 1).unwrap();
    let first = tracker.apply(&mut store, first, 1).unwrap();
    let second = replica.update("todos", "t1", json!({"v": 2}), 2).unwrap();
    let second = tracker.apply(&mut store, second, 2).unwrap();
    let third = replica.delete("todos", "t1", 3).unwrap();
    let third = tracker.apply(&mut store, third, 3).unwrap();
    assert_eq!(store.get("todos", "t1"), None);

    let result = RollbackManager::new(&mut tracker, &mut store)
        .rollback_ids(vec![second.clone(), first.clone(), third.clone()]);

    assert_eq!(result.rolled_back, vec![third, second, first]);
    assert_eq!(store.get("todos", "t1"), None);
    assert!(tracker.is_empty());
}

#[test]
fn partial_rollback_keeps_failed_update_visible() {
    let mut replica = Replica::new("a");
    let mut store = MemoryStore::new();
    let mut tracker = OptimisticTracker::new();

    for (collection, id) in [("todos", "t1"), ("archive", "a1"), ("todos", "t2")] {
        let change = replica.insert(collection, id, json!({}), 1).unwrap();
        tracker.apply(&mut store, change, 1).unwrap();
    }
    store.set_read_only("archive", true);

    let result = RollbackManager::new(&mut tracker, &mut store).rollback_all();
    assert_eq!(result.succeeded(), 2);
    assert_eq!(result.failed_count(), 1);
    assert!(!result.is_complete());
    assert!(tracker.has_unconfirmed("archive", "a1"));
    assert!(store.get("archive", "a1").is_some());
}

// ============================================================================
// Selective Sync
// ============================================================================

#[test]
fn filter_without_collections_syncs_everything() {
    let sync = SelectiveSync::from_filters([SyncFilter::new("all")]);
    for (collection, doc) in [
        ("todos", json!({"owner": "alice"})),
        ("notes", json!({})),
        ("x", json!(null)),
    ] {
        assert!(sync.evaluate(collection, &doc).should_sync);
    }
}

#[test]
fn missing_nested_path_never_panics() {
    let sync = SelectiveSync::from_filters([SyncFilter::new("deep")
        .for_collection("todos")
        .rule("a.b.c.d", FilterOperator::Gt, json!(1))]);
    assert!(!sync.should_sync("todos", &json!({"a": {"b": 5}})));
    assert!(!sync.should_sync("todos", &json!("scalar")));
    assert!(sync.should_sync("todos", &json!({"a": {"b": {"c": {"d": 2}}}})));
}

use std::time::{Duration, Instant};

use kadex::{Bytes, Id, Testnet};

/// Poll `predicate` until it holds or the deadline passes.
fn eventually(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let started = Instant::now();

    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    false
}

#[test]
fn put_needs_a_single_acknowledgment() {
    let testnet = Testnet::new(5).unwrap();

    let key = Id::random();
    let result = testnet.nodes[2].put(key, Bytes::from("replicated")).unwrap();

    assert!(!result.stored_at.is_empty());
    assert!(result.attempted >= result.stored_at.len());
}

#[test]
fn get_round_trips_through_other_nodes() {
    let testnet = Testnet::new(6).unwrap();

    let key = Id::random();
    let value = Bytes::from("stored once, found elsewhere");

    testnet.nodes[0].put(key, value.clone()).unwrap();

    let found = testnet.nodes[4].get(key).unwrap();

    assert_eq!(found.map(|tuple| tuple.value().clone()), Some(value));
}

#[test]
fn missing_key_lookup_terminates_empty_handed() {
    let testnet = Testnet::new(10).unwrap();

    let found = testnet.nodes[3].get(Id::random()).unwrap();

    assert!(found.is_none());
}

#[test]
fn find_node_returns_at_most_k_closest() {
    let testnet = Testnet::new(8).unwrap();

    let target = Id::random();
    let closest = testnet.nodes[1].find_node(target).unwrap();

    assert!(!closest.is_empty());
    assert!(closest.len() <= 20);

    let distances: Vec<_> = closest
        .iter()
        .map(|contact| contact.id().xor(&target))
        .collect();
    let mut sorted = distances.clone();
    sorted.sort();

    assert_eq!(distances, sorted);
}

#[test]
fn delete_removes_the_value() {
    let testnet = Testnet::new(5).unwrap();

    let key = Id::random();

    testnet.nodes[1].put(key, Bytes::from("short lived")).unwrap();
    assert!(testnet.nodes[3].get(key).unwrap().is_some());

    testnet.nodes[1].delete(key).unwrap();

    assert!(testnet.nodes[3].get(key).unwrap().is_none());
}

#[test]
fn values_are_forwarded_to_a_late_joiner() {
    let mut testnet = Testnet::new(6).unwrap();

    let key = Id::random();
    let value = Bytes::from("catches up");

    testnet.nodes[2].put(key, value.clone()).unwrap();

    // A node joining after the put receives the value from whichever
    // responsible node sights it.
    let late = testnet.add_node().unwrap();

    let caught_up = eventually(Duration::from_secs(10), || {
        late.values()
            .unwrap_or_default()
            .iter()
            .any(|tuple| tuple.key() == &key && tuple.value() == &value)
    });

    assert!(caught_up, "the late joiner never received the value");
}

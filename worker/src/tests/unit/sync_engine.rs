// Session sync: change detection, idempotence, and per-subject failure
// isolation.

use uplink_shared::SessionState;

use crate::events::EventBus;
use crate::sync::{MemorySyncStore, SyncEngine, SyncStore};
use crate::tests::fixtures::FakeSessionAuthority;

fn subjects(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn state_change_is_recorded_and_published_once() {
    let store = MemorySyncStore::shared();
    let authority = FakeSessionAuthority::with_states(&[("alice01", SessionState::Online)]);
    let events = EventBus::new();
    let mut receiver = events.subscribe();

    let engine = SyncEngine::new(store.clone(), authority, events);
    let report = engine.run(&subjects(&["alice01"])).await.unwrap();

    assert_eq!(report.checked, 1);
    assert_eq!(report.changed, 1);
    assert_eq!(report.unchanged, 0);

    let event = receiver.try_recv().unwrap();
    assert_eq!(event.subject_id, "alice01");
    assert_eq!(event.previous, SessionState::Unknown);
    assert_eq!(event.current, SessionState::Online);
    assert!(receiver.try_recv().is_err(), "exactly one event per change");

    let record = store.latest("alice01").await.unwrap().unwrap();
    assert_eq!(record.remote_state, SessionState::Online);
    assert_eq!(record.local_state, SessionState::Unknown);
}

#[tokio::test]
async fn identical_snapshot_is_idempotent() {
    let store = MemorySyncStore::shared();
    let authority = FakeSessionAuthority::with_states(&[
        ("alice01", SessionState::Online),
        ("bob02", SessionState::Offline),
    ]);
    let events = EventBus::new();
    let mut receiver = events.subscribe();

    let engine = SyncEngine::new(store, authority, events);
    let names = subjects(&["alice01", "bob02"]);

    let first = engine.run(&names).await.unwrap();
    assert_eq!(first.changed, 2);
    receiver.try_recv().unwrap();
    receiver.try_recv().unwrap();

    // Same remote snapshot again: nothing recorded, nothing published.
    let second = engine.run(&names).await.unwrap();
    assert_eq!(second.checked, 2);
    assert_eq!(second.changed, 0);
    assert_eq!(second.unchanged, 2);
    assert!(receiver.try_recv().is_err());
}

#[tokio::test]
async fn transition_back_is_a_new_change() {
    let store = MemorySyncStore::shared();
    let authority = FakeSessionAuthority::with_states(&[("alice01", SessionState::Online)]);
    let events = EventBus::new();
    let engine = SyncEngine::new(store.clone(), authority.clone(), events);
    let names = subjects(&["alice01"]);

    engine.run(&names).await.unwrap();

    authority.set_state("alice01", SessionState::Offline).await;
    let report = engine.run(&names).await.unwrap();
    assert_eq!(report.changed, 1);

    let record = store.latest("alice01").await.unwrap().unwrap();
    assert_eq!(record.local_state, SessionState::Online);
    assert_eq!(record.remote_state, SessionState::Offline);
}

#[tokio::test]
async fn one_failing_subject_never_blocks_the_rest() {
    let store = MemorySyncStore::shared();
    // bob02 has no session data; the authority reports a per-subject error.
    let authority = FakeSessionAuthority::with_states(&[("alice01", SessionState::Online)]);
    let events = EventBus::new();

    let engine = SyncEngine::new(store.clone(), authority, events);
    let report = engine.run(&subjects(&["alice01", "bob02"])).await.unwrap();

    assert_eq!(report.checked, 2);
    assert_eq!(report.changed, 1);
    assert_eq!(report.failed, 1);

    assert!(store.latest("alice01").await.unwrap().is_some());
    assert!(store.latest("bob02").await.unwrap().is_none());
}

#[tokio::test]
async fn empty_subject_list_is_a_no_op() {
    let store = MemorySyncStore::shared();
    let authority = FakeSessionAuthority::with_states(&[]);
    let engine = SyncEngine::new(store, authority, EventBus::new());

    let report = engine.run(&[]).await.unwrap();
    assert_eq!(report.checked, 0);
    assert_eq!(report.changed, 0);
}

//! Integration tests for the storage proxies.
//!
//! These tests drive proxies through an engine and an in-memory store:
//! - Synchronization: full models, gaps, catch-up and stale responses
//! - Collections: echo suppression, pass-through observers, remote writers
//! - Variables: barriers and last-writer-wins
//! - Streaming: cursors over snapshots
//! - Failing transports: a refused request leaves the proxy as it was
//! - Version monotonicity under arbitrary delivery orders

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use strand_proxy::proxy::VariableProxy;
use strand_proxy::{
    Barrier, Entity, EngineConfig, Inbound, MembershipKey, MemoryStore, MemoryStoreConfig,
    ModelEntry, ModelItem, NotificationScheduler, ObserverId, ObserverOptions,
    ObserverOptionsBuilder, ProxyError, ProxyId, ProxyListener, RemoteMessage, RemoteWrite,
    StorageEngine, StoreRequest, SyncResponse, SyncState, TransportError, UpdateEvent,
};
use futures::StreamExt;
use tokio::sync::mpsc;

/// Shared fixtures: a recording observer and a manually flushed engine.
mod harness {
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use strand_proxy::{
        Change, EngineConfigBuilder, Entity, ManualSpawner, MemoryStore, MemoryStoreConfig,
        ModelEntry, NotificationScheduler, Observer, ObserverId, ObserverResult, ObserverUpdate,
        ProxyId, StorageEngine, SyncModel,
    };

    pub fn entity(id: &str) -> Entity {
        Entity::new(id, json!({ "name": id }))
    }

    pub fn entry(id: &str) -> ModelEntry<Entity> {
        ModelEntry::new(id, entity(id), vec![format!("k-{}", id)])
    }

    fn ids(values: &[Entity]) -> String {
        values
            .iter()
            .map(|value| value.id.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }

    fn cell(value: &Option<Entity>) -> &str {
        value.as_ref().map_or("none", |value| value.id.as_str())
    }

    /// Logs every callback as a compact string.
    pub struct Recorder {
        id: ObserverId,
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        pub fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: ObserverId::new(id),
                log: Mutex::new(Vec::new()),
            })
        }

        pub fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.log.lock())
        }
    }

    impl Observer<Entity> for Recorder {
        fn id(&self) -> &ObserverId {
            &self.id
        }

        fn on_sync(&self, proxy: &ProxyId, model: SyncModel<Entity>) -> ObserverResult {
            let model = match &model {
                SyncModel::Collection(values) => format!("[{}]", ids(values)),
                SyncModel::Variable(value) => cell(value).to_string(),
                SyncModel::Unsynchronized => "stream".to_string(),
            };
            self.log.lock().push(format!("sync:{}:{}", proxy, model));
            Ok(())
        }

        fn on_update(&self, proxy: &ProxyId, update: ObserverUpdate<Entity>) -> ObserverResult {
            let change = match &update.change {
                Change::Collection { added, removed } => {
                    format!("+[{}]-[{}]", ids(added), ids(removed))
                }
                Change::Variable { data } => format!("={}", cell(data)),
            };
            let mine = if update.originator { ":mine" } else { "" };
            self.log
                .lock()
                .push(format!("update:{}:{}{}", proxy, change, mine));
            Ok(())
        }

        fn on_desync(&self, proxy: &ProxyId) -> ObserverResult {
            self.log.lock().push(format!("desync:{}", proxy));
            Ok(())
        }
    }

    pub struct Harness {
        pub store: Arc<MemoryStore<Entity>>,
        pub engine: StorageEngine<Entity>,
        pub spawner: ManualSpawner,
    }

    impl Harness {
        /// Full-model requests wait for an explicit response.
        pub fn new() -> Self {
            Self::with_config(MemoryStoreConfig {
                auto_sync: false,
                ..MemoryStoreConfig::default()
            })
        }

        pub fn with_config(config: MemoryStoreConfig) -> Self {
            let store = Arc::new(MemoryStore::new(config));
            let spawner = ManualSpawner::new();
            let engine = Self::engine_on(&store, &spawner, "engine");
            Self {
                store,
                engine,
                spawner,
            }
        }

        pub fn engine_on(
            store: &Arc<MemoryStore<Entity>>,
            spawner: &ManualSpawner,
            name: &str,
        ) -> StorageEngine<Entity> {
            let scheduler = NotificationScheduler::with_spawner(Arc::new(spawner.clone()));
            let config = EngineConfigBuilder::new()
                .name(name)
                .replica_id(name)
                .build();
            StorageEngine::new(store.clone(), scheduler, config)
        }

        /// Pump and flush until nothing moves.
        pub fn settle(&self) {
            settle_all(&[&self.engine], &self.spawner);
        }
    }

    pub fn settle_all(engines: &[&StorageEngine<Entity>], spawner: &ManualSpawner) {
        loop {
            let mut moved = 0;
            for engine in engines {
                moved += engine.pump().expect("pump");
            }
            moved += spawner.run_pending();
            if moved == 0 {
                return;
            }
        }
    }
}

use harness::{entity, entry, settle_all, Harness, Recorder};

fn keys(names: &[&str]) -> Vec<MembershipKey> {
    names.iter().map(|k| k.to_string()).collect()
}

fn add_event(version: u64, id: &str) -> UpdateEvent<Entity> {
    UpdateEvent::add(
        version,
        vec![ModelItem::new(entity(id), vec![format!("k-{}", id)], true)],
    )
}

fn desync_options() -> ObserverOptions {
    ObserverOptionsBuilder::new().notify_desync(true).build()
}

// ============================================================================
// Synchronization
// ============================================================================

#[tokio::test]
async fn test_full_model_response_synchronizes() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register(o1.clone()).unwrap();
    assert_eq!(things.state().unwrap(), SyncState::Pending);
    assert_eq!(h.store.pending_syncs(things.id()), 1);

    h.store.respond_sync_with(
        things.id(),
        SyncResponse {
            version: 5,
            model: vec![entry("e1")],
        },
    );
    h.settle();

    assert_eq!(things.state().unwrap(), SyncState::Full);
    assert_eq!(things.version().unwrap(), Some(5));
    assert_eq!(o1.take(), vec!["sync:things:[e1]"]);

    h.store.take_requests();
    assert_eq!(things.to_list().await.unwrap(), vec![entity("e1")]);
    assert_eq!(things.get("e1").await.unwrap(), Some(entity("e1")));
    // Served locally.
    assert!(h.store.take_requests().is_empty());
}

#[test]
fn test_gap_while_full_desynchronizes_once() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register_with(o1.clone(), desync_options()).unwrap();
    h.store.respond_sync_with(
        things.id(),
        SyncResponse {
            version: 5,
            model: vec![entry("e1")],
        },
    );
    h.settle();
    o1.take();

    let listener = h.engine.listener(things.id().clone());
    listener.update(add_event(7, "e3")).unwrap();
    h.settle();

    assert_eq!(things.state().unwrap(), SyncState::Pending);
    assert_eq!(things.version().unwrap(), Some(5));
    assert_eq!(o1.take(), vec!["desync:things"]);
    assert_eq!(h.store.pending_syncs(things.id()), 1);

    // Further gaps while the request is in flight do not ask again.
    listener.update(add_event(8, "e4")).unwrap();
    h.settle();
    assert_eq!(h.store.pending_syncs(things.id()), 1);
    assert!(o1.take().is_empty());
}

#[test]
fn test_catch_up_before_response_makes_response_stale() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register_with(o1.clone(), desync_options()).unwrap();
    h.store.respond_sync_with(
        things.id(),
        SyncResponse {
            version: 5,
            model: vec![entry("e1")],
        },
    );
    h.settle();
    o1.take();

    let listener = h.engine.listener(things.id().clone());
    listener.update(add_event(7, "e3")).unwrap();
    listener.update(add_event(8, "e4")).unwrap();
    listener.update(add_event(6, "e2")).unwrap();
    h.settle();

    assert_eq!(things.state().unwrap(), SyncState::Full);
    assert_eq!(things.version().unwrap(), Some(8));
    assert_eq!(
        o1.take(),
        vec![
            "desync:things",
            "update:things:+[e2]-[]",
            "update:things:+[e3]-[]",
            "update:things:+[e4]-[]",
            "sync:things:[e1|e2|e3|e4]",
        ]
    );

    // The response to the desync request is now behind the local copy.
    h.store.respond_sync_with(
        things.id(),
        SyncResponse {
            version: 7,
            model: vec![entry("e1")],
        },
    );
    h.settle();
    assert_eq!(things.version().unwrap(), Some(8));
    assert!(o1.take().is_empty());
}

#[tokio::test]
async fn test_response_discards_covered_events_and_applies_the_rest() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register_with(o1.clone(), desync_options()).unwrap();
    h.store.respond_sync_with(
        things.id(),
        SyncResponse {
            version: 5,
            model: vec![entry("e1")],
        },
    );
    h.settle();
    o1.take();

    let listener = h.engine.listener(things.id().clone());
    listener.update(add_event(7, "e3")).unwrap();
    listener.update(add_event(8, "e4")).unwrap();
    h.settle();

    h.store.respond_sync_with(
        things.id(),
        SyncResponse {
            version: 7,
            model: vec![entry("e1"), entry("e2"), entry("e3")],
        },
    );
    h.settle();

    assert_eq!(things.state().unwrap(), SyncState::Full);
    assert_eq!(things.version().unwrap(), Some(8));
    assert_eq!(
        o1.take(),
        vec![
            "desync:things",
            "sync:things:[e1|e2|e3]",
            "update:things:+[e4]-[]",
        ]
    );
    assert_eq!(
        things.to_list().await.unwrap(),
        vec![entity("e1"), entity("e2"), entity("e3"), entity("e4")]
    );
}

#[test]
fn test_stale_updates_are_discarded() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register(o1.clone()).unwrap();
    h.store.respond_sync_with(
        things.id(),
        SyncResponse {
            version: 5,
            model: vec![entry("e1")],
        },
    );
    h.settle();
    o1.take();

    h.engine
        .listener(things.id().clone())
        .update(add_event(3, "e9"))
        .unwrap();
    h.settle();

    assert_eq!(things.version().unwrap(), Some(5));
    assert_eq!(things.state().unwrap(), SyncState::Full);
    assert!(o1.take().is_empty());
}

#[test]
fn test_stale_model_is_discarded() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    things.register(Recorder::new("o1")).unwrap();
    h.store.respond_sync_with(
        things.id(),
        SyncResponse {
            version: 5,
            model: vec![entry("e1")],
        },
    );
    h.settle();

    things.resynchronize().unwrap();
    h.store.respond_sync_with(
        things.id(),
        SyncResponse {
            version: 5,
            model: Vec::new(),
        },
    );
    h.settle();

    // A resynchronize on a full proxy keeps serving the local copy.
    assert_eq!(things.state().unwrap(), SyncState::Full);
    assert_eq!(things.version().unwrap(), Some(5));
}

#[tokio::test]
async fn test_resynchronize_recovers_silently_dropped_events() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register(o1.clone()).unwrap();
    h.store.respond_sync(things.id());
    h.settle();
    o1.take();

    h.store
        .remote_store(things.id(), entity("e1"), RemoteWrite::silent())
        .unwrap();
    h.settle();
    assert_eq!(things.version().unwrap(), Some(0));

    things.resynchronize().unwrap();
    h.store.respond_sync(things.id());
    h.settle();

    assert_eq!(things.version().unwrap(), Some(1));
    assert_eq!(o1.take(), vec!["sync:things:[e1]"]);
    assert_eq!(things.to_list().await.unwrap(), vec![entity("e1")]);
}

#[test]
fn test_late_registration_gets_immediate_sync() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let things = h.engine.collection("things").unwrap();
    things.register(Recorder::new("o1")).unwrap();
    h.store
        .remote_store(things.id(), entity("e1"), RemoteWrite::default())
        .unwrap();
    h.settle();

    let late = Recorder::new("late");
    let quiet = Recorder::new("quiet");
    things.register(late.clone()).unwrap();
    things
        .register_with(
            quiet.clone(),
            ObserverOptionsBuilder::new().notify_sync(false).build(),
        )
        .unwrap();
    h.settle();

    assert_eq!(late.take(), vec!["sync:things:[e1]"]);
    assert!(quiet.take().is_empty());
    // One listener and one full-model request, however many observers.
    let requests = h.store.take_requests();
    let initializations = requests
        .iter()
        .filter(|r| matches!(r, StoreRequest::Initialize { .. }))
        .count();
    let syncs = requests
        .iter()
        .filter(|r| matches!(r, StoreRequest::Synchronize { .. }))
        .count();
    assert_eq!((initializations, syncs), (1, 1));
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register(o1.clone()).unwrap();

    let err = things.register(o1).unwrap_err();
    assert_eq!(
        err,
        ProxyError::AlreadyRegistered {
            proxy: ProxyId::new("things"),
            observer: ObserverId::new("o1"),
        }
    );
}

#[test]
fn test_malformed_update_is_reported() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    things.register(Recorder::new("o1")).unwrap();

    h.engine
        .listener(things.id().clone())
        .update(UpdateEvent::data(1, Some(entity("x")), None))
        .unwrap();

    assert!(matches!(
        h.engine.pump(),
        Err(ProxyError::MalformedUpdate { .. })
    ));
}

// ============================================================================
// Collections
// ============================================================================

#[test]
fn test_own_writes_notify_once() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let things = h.engine.collection("things").unwrap();
    let writer = Recorder::new("writer");
    let reader = Recorder::new("reader");
    things.register(writer.clone()).unwrap();
    things.register(reader.clone()).unwrap();
    h.settle();
    writer.take();
    reader.take();

    things
        .store(entity("e1"), keys(&["k1"]), &ObserverId::new("writer"))
        .unwrap();
    h.settle();

    // The store's echo advances the version without a second notification.
    assert_eq!(things.version().unwrap(), Some(1));
    assert_eq!(writer.take(), vec!["update:things:+[e1]-[]:mine"]);
    assert_eq!(reader.take(), vec!["update:things:+[e1]-[]"]);

    things.remove("e1", Vec::new(), &ObserverId::new("reader")).unwrap();
    h.settle();
    assert_eq!(writer.take(), vec!["update:things:+[]-[e1]"]);
    assert_eq!(reader.take(), vec!["update:things:+[]-[e1]:mine"]);
    assert!(h.store.list(things.id()).is_empty());
}

#[test]
fn test_remote_writers_reach_keep_synced_observers() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register(o1.clone()).unwrap();
    h.settle();
    o1.take();

    h.store
        .remote_store(things.id(), entity("e1"), RemoteWrite::default())
        .unwrap();
    h.store
        .remote_store(things.id(), entity("e2"), RemoteWrite::default())
        .unwrap();
    h.store
        .remote_remove(things.id(), "e1", RemoteWrite::default())
        .unwrap();
    h.settle();

    assert_eq!(
        o1.take(),
        vec![
            "update:things:+[e1]-[]",
            "update:things:+[e2]-[]",
            "update:things:+[]-[e1]",
        ]
    );
    assert_eq!(things.version().unwrap(), Some(3));
}

#[test]
fn test_pass_through_observers_see_events_without_syncing() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    let passer = Recorder::new("passer");
    things
        .register_with(
            passer.clone(),
            ObserverOptionsBuilder::new().keep_synced(false).build(),
        )
        .unwrap();
    assert_eq!(h.store.pending_syncs(things.id()), 0);

    h.store
        .remote_store(things.id(), entity("e1"), RemoteWrite::default())
        .unwrap();
    h.store
        .remote_remove(things.id(), "e1", RemoteWrite::default())
        .unwrap();
    // Not effective at the store, so nothing to pass on.
    h.engine
        .listener(things.id().clone())
        .update(UpdateEvent::remove(
            9,
            vec![ModelItem::new(entity("e1"), keys(&["k-e1"]), false)],
        ))
        .unwrap();
    h.settle();

    assert_eq!(
        passer.take(),
        vec!["update:things:+[e1]-[]", "update:things:+[]-[e1]"]
    );
    assert_eq!(things.state().unwrap(), SyncState::None);
    assert_eq!(things.version().unwrap(), None);
}

#[tokio::test]
async fn test_unsynchronized_reads_go_to_the_store() {
    let h = Harness::new();
    let things = h.engine.collection("things").unwrap();
    h.store
        .remote_store(things.id(), entity("e1"), RemoteWrite::default())
        .unwrap();

    assert_eq!(things.to_list().await.unwrap(), vec![entity("e1")]);
    assert_eq!(things.get("e1").await.unwrap(), Some(entity("e1")));
    assert_eq!(things.get("nope").await.unwrap(), None);

    let reads = h
        .store
        .take_requests()
        .into_iter()
        .filter(|r| matches!(r, StoreRequest::ToList { .. }))
        .count();
    assert_eq!(reads, 3);
}

#[test]
fn test_clear_removes_everything() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register(o1.clone()).unwrap();
    for id in ["e1", "e2"] {
        h.store
            .remote_store(things.id(), entity(id), RemoteWrite::default())
            .unwrap();
    }
    h.settle();
    o1.take();

    things.clear(&ObserverId::new("o1")).unwrap();
    h.settle();

    assert_eq!(o1.take(), vec!["update:things:+[]-[e1|e2]:mine"]);
    assert!(h.store.list(things.id()).is_empty());
}

#[test]
fn test_two_engines_converge_through_one_store() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let other = Harness::engine_on(&h.store, &h.spawner, "other");
    let mine = h.engine.collection("things").unwrap();
    let theirs = other.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    let o2 = Recorder::new("o2");
    mine.register(o1.clone()).unwrap();
    theirs.register(o2.clone()).unwrap();
    settle_all(&[&h.engine, &other], &h.spawner);
    o1.take();
    o2.take();

    mine.add(entity("e1"), &ObserverId::new("o1")).unwrap();
    theirs.add(entity("e2"), &ObserverId::new("o2")).unwrap();
    settle_all(&[&h.engine, &other], &h.spawner);

    assert_eq!(
        o1.take(),
        vec!["update:things:+[e1]-[]:mine", "update:things:+[e2]-[]"]
    );
    assert_eq!(
        o2.take(),
        vec!["update:things:+[e2]-[]:mine", "update:things:+[e1]-[]"]
    );
    assert_eq!(mine.version().unwrap(), Some(2));
    assert_eq!(theirs.version().unwrap(), Some(2));
}

#[test]
fn test_deregistered_observers_hear_nothing() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let things = h.engine.collection("things").unwrap();
    let stays = Recorder::new("stays");
    let leaves = Recorder::new("leaves");
    things.register(stays.clone()).unwrap();
    things.register(leaves.clone()).unwrap();
    h.settle();
    leaves.take();

    things.deregister(&ObserverId::new("leaves"));
    h.store
        .remote_store(things.id(), entity("e1"), RemoteWrite::default())
        .unwrap();
    h.settle();

    assert!(leaves.take().is_empty());
    assert_eq!(stays.take().last().unwrap(), "update:things:+[e1]-[]");
}

#[tokio::test]
async fn test_store_refused_remotely_leaves_local_copy_untouched() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let things = h.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    let me = ObserverId::new("o1");
    let revision = |n: u64| Entity::new("e1", json!({ "rev": n }));
    things.register(o1.clone()).unwrap();
    h.store
        .remote_store(
            things.id(),
            revision(1),
            RemoteWrite {
                keys: keys(&["k1"]),
                ..RemoteWrite::default()
            },
        )
        .unwrap();
    h.settle();
    o1.take();

    // Another writer gets in first; its event is still on the way.
    let withheld = h
        .store
        .remote_store(
            things.id(),
            revision(2),
            RemoteWrite {
                keys: keys(&["k1", "k9"]),
                ..RemoteWrite::silent()
            },
        )
        .unwrap();

    // Fresh locally, already known at the store.
    let err = things.store(revision(3), keys(&["k9"]), &me).unwrap_err();
    assert!(matches!(
        err,
        ProxyError::Transport(TransportError::Rejected(_))
    ));
    assert_eq!(things.to_list().await.unwrap(), vec![revision(1)]);
    h.settle();
    assert!(o1.take().is_empty());

    h.store.deliver(things.id(), withheld);
    h.settle();
    things.resynchronize().unwrap();
    h.settle();

    assert_eq!(things.state().unwrap(), SyncState::Full);
    assert_eq!(things.version().unwrap(), Some(h.store.version(things.id())));
    assert_eq!(things.to_list().await.unwrap(), h.store.list(things.id()));
    assert_eq!(o1.take(), vec!["update:things:+[e1]-[]"]);
}

#[test]
fn test_reregistered_pass_through_observer_hears_each_event_once() {
    let h = Harness::new();
    let passer = Recorder::new("passer");
    let options = ObserverOptionsBuilder::new().keep_synced(false).build();
    let things = h.engine.collection("things").unwrap();
    things.register_with(passer.clone(), options).unwrap();
    things.deregister(&ObserverId::new("passer"));
    assert!(!h.engine.contains(things.id()));
    assert_eq!(h.store.listener_count(things.id()), 0);

    let things = h.engine.collection("things").unwrap();
    things.register_with(passer.clone(), options).unwrap();
    assert_eq!(h.store.listener_count(things.id()), 1);

    h.store
        .remote_store(things.id(), entity("e1"), RemoteWrite::default())
        .unwrap();
    h.settle();
    assert_eq!(passer.take(), vec!["update:things:+[e1]-[]"]);
}

// ============================================================================
// Variables
// ============================================================================

fn direct_variable(h: &Harness) -> (VariableProxy<Entity>, mpsc::UnboundedReceiver<Inbound<Entity>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = ProxyId::new("cell");
    let scheduler = NotificationScheduler::with_spawner(Arc::new(h.spawner.clone()));
    let proxy = VariableProxy::new(id.clone(), h.store.clone(), scheduler, ProxyListener::new(id, tx));
    (proxy, rx)
}

fn next_update(rx: &mut mpsc::UnboundedReceiver<Inbound<Entity>>) -> UpdateEvent<Entity> {
    match rx.try_recv().unwrap().message {
        RemoteMessage::Update(event) => event,
        other => panic!("expected an update, got {:?}", other),
    }
}

#[test]
fn test_barrier_suppresses_until_own_echo() {
    let h = Harness::new();
    let (mut cell, mut rx) = direct_variable(&h);
    let o1 = Recorder::new("o1");
    let me = ObserverId::new("o1");
    cell.register(o1.clone(), ObserverOptions::default()).unwrap();
    assert_eq!(cell.state(), SyncState::Pending);

    cell.set(entity("A"), &me).unwrap();
    let b1 = cell.model().barrier().cloned().unwrap();
    let echo = next_update(&mut rx);
    assert_eq!(echo.barrier(), Some(&b1));

    cell.on_update(UpdateEvent::data(1, Some(entity("B")), Some(Barrier::new("stale"))))
        .unwrap();
    assert_eq!(cell.model().value(), Some(&entity("A")));
    assert_eq!(cell.model().barrier(), Some(&b1));

    cell.on_update(echo).unwrap();
    assert!(cell.model().barrier().is_none());
    assert_eq!(cell.state(), SyncState::Full);
    assert_eq!(cell.version(), Some(1));

    h.spawner.run_pending();
    assert_eq!(o1.take(), vec!["update:cell:=A:mine", "sync:cell:A"]);
}

#[test]
fn test_last_local_write_wins_whatever_the_ack_order() {
    for acks_in_order in [true, false] {
        let h = Harness::new();
        let (mut cell, mut rx) = direct_variable(&h);
        let o1 = Recorder::new("o1");
        let me = ObserverId::new("o1");
        cell.register(o1.clone(), ObserverOptions::default()).unwrap();
        cell.on_synchronize(h.store.snapshot(&ProxyId::new("cell")))
            .unwrap();

        cell.set(entity("A"), &me).unwrap();
        cell.set(entity("B"), &me).unwrap();
        let ack_a = next_update(&mut rx);
        let ack_b = next_update(&mut rx);
        let acks = if acks_in_order {
            [ack_a, ack_b]
        } else {
            [ack_b, ack_a]
        };
        for ack in acks {
            cell.on_update(ack).unwrap();
        }

        assert_eq!(cell.model().value(), Some(&entity("B")));
        assert!(cell.model().barrier().is_none());
        assert_eq!(cell.version(), Some(2));
        h.spawner.run_pending();
        // Only the two local transitions; the acks change nothing.
        assert_eq!(
            o1.take(),
            vec!["sync:cell:none", "update:cell:=A:mine", "update:cell:=B:mine"]
        );
    }
}

#[test]
fn test_write_that_lost_to_ours_is_skipped() {
    let h = Harness::new();
    let (mut cell, mut rx) = direct_variable(&h);
    let o1 = Recorder::new("o1");
    let me = ObserverId::new("o1");
    let id = ProxyId::new("cell");
    cell.register(o1.clone(), ObserverOptions::default()).unwrap();
    cell.on_synchronize(h.store.snapshot(&id)).unwrap();

    // Another client's write lands first but its event is late.
    let theirs = h
        .store
        .remote_set(&id, Some(entity("C")), RemoteWrite::silent());
    cell.set(entity("A"), &me).unwrap();
    let ours = next_update(&mut rx);

    cell.on_update(theirs).unwrap();
    cell.on_update(ours).unwrap();

    assert_eq!(cell.model().value(), Some(&entity("A")));
    assert_eq!(h.store.value(&id), Some(entity("A")));
    h.spawner.run_pending();
    assert_eq!(o1.take(), vec!["sync:cell:none", "update:cell:=A:mine"]);
}

#[tokio::test]
async fn test_variable_follows_remote_writes() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let cell = h.engine.variable("cell").unwrap();
    let o1 = Recorder::new("o1");
    cell.register(o1.clone()).unwrap();
    h.settle();

    h.store
        .remote_set(cell.id(), Some(entity("C")), RemoteWrite::default());
    h.settle();
    assert_eq!(o1.take(), vec!["sync:cell:none", "update:cell:=C"]);

    h.store.take_requests();
    assert_eq!(cell.fetch().await.unwrap(), Some(entity("C")));
    assert!(h.store.take_requests().is_empty());

    cell.clear(&ObserverId::new("o1")).unwrap();
    h.settle();
    assert_eq!(o1.take(), vec!["update:cell:=none:mine"]);
    assert_eq!(h.store.value(cell.id()), None);
    assert_eq!(cell.fetch().await.unwrap(), None);
}

#[tokio::test]
async fn test_unsynchronized_variable_reads_from_store() {
    let h = Harness::new();
    let cell = h.engine.variable("cell").unwrap();
    h.store
        .remote_set(cell.id(), Some(entity("C")), RemoteWrite::default());

    assert_eq!(cell.fetch().await.unwrap(), Some(entity("C")));
    assert!(h
        .store
        .take_requests()
        .iter()
        .any(|r| matches!(r, StoreRequest::Get { .. })));
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_stream_pages_through_snapshot() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let big = h.engine.streaming("big").unwrap();
    let o1 = Recorder::new("o1");
    let me = ObserverId::new("o1");
    big.register(o1.clone()).unwrap();
    h.settle();
    assert_eq!(o1.take(), vec!["sync:big:stream"]);

    for n in 1..=5 {
        let id = format!("i{}", n);
        big.store(entity(&id), vec![format!("k{}", n)], &me)
            .await
            .unwrap();
    }

    let mut cursor = big.stream(2, true).await.unwrap();
    let mut pages = Vec::new();
    loop {
        let page = cursor.next().await.unwrap();
        let ids: Vec<String> = page.value.iter().map(|v| v.id.clone()).collect();
        pages.push((ids, page.done));
        if page.done {
            break;
        }
    }
    assert_eq!(
        pages,
        vec![
            (vec!["i1".to_string(), "i2".to_string()], false),
            (vec!["i3".to_string(), "i4".to_string()], false),
            (vec!["i5".to_string()], true),
        ]
    );
    assert!(cursor.next().await.unwrap().value.is_empty());
    cursor.close().unwrap();

    big.remove("i3", &me).await.unwrap();
    let backward: Vec<Vec<Entity>> = big
        .stream(3, false)
        .await
        .unwrap()
        .into_stream()
        .map(|page| page.unwrap())
        .collect()
        .await;
    assert_eq!(
        backward,
        vec![
            vec![entity("i5"), entity("i4"), entity("i2")],
            vec![entity("i1")],
        ]
    );

    assert!(matches!(
        big.stream(0, true).await,
        Err(ProxyError::InvalidPageSize)
    ));
}

// ============================================================================
// Failing transports
// ============================================================================

/// A memory store behind a connection that can be cut per request kind.
mod flaky {
    use super::harness::settle_all;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;
    use strand_proxy::{
        Barrier, CursorId, CursorPage, EngineConfigBuilder, Entity, ManualSpawner, MembershipKey,
        MemoryStore, NotificationScheduler, ObserverId, ProxyId, ProxyListener, RemoveRequest,
        StorageEngine, Transport, TransportError,
    };

    pub struct FlakyTransport {
        store: Arc<MemoryStore<Entity>>,
        failing: Mutex<HashSet<&'static str>>,
    }

    impl FlakyTransport {
        /// Requests named here fail with `Disconnected` until [`heal`](Self::heal).
        pub fn fail(&self, request: &'static str) {
            self.failing.lock().insert(request);
        }

        pub fn heal(&self) {
            self.failing.lock().clear();
        }

        fn check(&self, request: &str) -> Result<(), TransportError> {
            if self.failing.lock().contains(request) {
                return Err(TransportError::Disconnected);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport<Entity> for FlakyTransport {
        fn initialize_proxy(
            &self,
            id: &ProxyId,
            listener: ProxyListener<Entity>,
        ) -> Result<(), TransportError> {
            self.check("initialize_proxy")?;
            self.store.initialize_proxy(id, listener)
        }

        fn detach_proxy(
            &self,
            id: &ProxyId,
            listener: &ProxyListener<Entity>,
        ) -> Result<(), TransportError> {
            self.check("detach_proxy")?;
            self.store.detach_proxy(id, listener)
        }

        fn synchronize_proxy(
            &self,
            id: &ProxyId,
            listener: ProxyListener<Entity>,
        ) -> Result<(), TransportError> {
            self.check("synchronize_proxy")?;
            self.store.synchronize_proxy(id, listener)
        }

        fn store(
            &self,
            id: &ProxyId,
            value: Entity,
            keys: Vec<MembershipKey>,
            originator: &ObserverId,
        ) -> Result<(), TransportError> {
            self.check("store")?;
            self.store.store(id, value, keys, originator)
        }

        fn remove(
            &self,
            id: &ProxyId,
            record_id: &str,
            keys: Vec<MembershipKey>,
            originator: &ObserverId,
        ) -> Result<(), TransportError> {
            self.check("remove")?;
            self.store.remove(id, record_id, keys, originator)
        }

        fn remove_multiple(
            &self,
            id: &ProxyId,
            items: Vec<RemoveRequest>,
            originator: &ObserverId,
        ) -> Result<(), TransportError> {
            self.check("remove_multiple")?;
            self.store.remove_multiple(id, items, originator)
        }

        fn set(
            &self,
            id: &ProxyId,
            value: Entity,
            originator: &ObserverId,
            barrier: Option<Barrier>,
        ) -> Result<(), TransportError> {
            self.check("set")?;
            self.store.set(id, value, originator, barrier)
        }

        fn clear(
            &self,
            id: &ProxyId,
            originator: &ObserverId,
            barrier: Option<Barrier>,
        ) -> Result<(), TransportError> {
            self.check("clear")?;
            self.store.clear(id, originator, barrier)
        }

        fn cursor_close(&self, id: &ProxyId, cursor: CursorId) -> Result<(), TransportError> {
            self.check("cursor_close")?;
            self.store.cursor_close(id, cursor)
        }

        async fn get(&self, id: &ProxyId) -> Result<Option<Entity>, TransportError> {
            self.check("get")?;
            self.store.get(id).await
        }

        async fn to_list(&self, id: &ProxyId) -> Result<Vec<Entity>, TransportError> {
            self.check("to_list")?;
            self.store.to_list(id).await
        }

        async fn stream_store(
            &self,
            id: &ProxyId,
            value: Entity,
            keys: Vec<MembershipKey>,
            originator: &ObserverId,
        ) -> Result<(), TransportError> {
            self.check("stream_store")?;
            self.store.stream_store(id, value, keys, originator).await
        }

        async fn stream_remove(
            &self,
            id: &ProxyId,
            record_id: &str,
            originator: &ObserverId,
        ) -> Result<(), TransportError> {
            self.check("stream_remove")?;
            self.store.stream_remove(id, record_id, originator).await
        }

        async fn stream(
            &self,
            id: &ProxyId,
            page_size: usize,
            forward: bool,
        ) -> Result<CursorId, TransportError> {
            self.check("stream")?;
            self.store.stream(id, page_size, forward).await
        }

        async fn cursor_next(
            &self,
            id: &ProxyId,
            cursor: CursorId,
        ) -> Result<CursorPage<Entity>, TransportError> {
            self.check("cursor_next")?;
            self.store.cursor_next(id, cursor).await
        }
    }

    /// An engine talking to an auto-answering store through a [`FlakyTransport`].
    pub struct FlakyHarness {
        pub store: Arc<MemoryStore<Entity>>,
        pub transport: Arc<FlakyTransport>,
        pub engine: StorageEngine<Entity>,
        pub spawner: ManualSpawner,
    }

    impl FlakyHarness {
        pub fn new() -> Self {
            let store = Arc::new(MemoryStore::default());
            let transport = Arc::new(FlakyTransport {
                store: store.clone(),
                failing: Mutex::new(HashSet::new()),
            });
            let spawner = ManualSpawner::new();
            let scheduler = NotificationScheduler::with_spawner(Arc::new(spawner.clone()));
            let config = EngineConfigBuilder::new().name("flaky").build();
            let engine = StorageEngine::new(transport.clone(), scheduler, config);
            Self {
                store,
                transport,
                engine,
                spawner,
            }
        }

        pub fn settle(&self) {
            settle_all(&[&self.engine], &self.spawner);
        }
    }
}

use flaky::FlakyHarness;

fn disconnected() -> ProxyError {
    ProxyError::Transport(TransportError::Disconnected)
}

/// A synchronized collection holding `e1`, with `o1` registered and drained.
fn flaky_things(f: &FlakyHarness) -> (strand_proxy::CollectionHandle<Entity>, Arc<Recorder>) {
    let things = f.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");
    things.register(o1.clone()).unwrap();
    f.store
        .remote_store(things.id(), entity("e1"), RemoteWrite::default())
        .unwrap();
    f.settle();
    o1.take();
    (things, o1)
}

#[tokio::test]
async fn test_failed_collection_writes_change_nothing() {
    let f = FlakyHarness::new();
    let (things, o1) = flaky_things(&f);
    let me = ObserverId::new("o1");
    let before = things.to_list().await.unwrap();
    let version = things.version().unwrap();

    f.transport.fail("store");
    f.transport.fail("remove");
    f.transport.fail("remove_multiple");
    assert_eq!(
        things.store(entity("e2"), keys(&["k2"]), &me).unwrap_err(),
        disconnected()
    );
    assert_eq!(things.add(entity("e3"), &me).unwrap_err(), disconnected());
    assert_eq!(
        things.remove("e1", Vec::new(), &me).unwrap_err(),
        disconnected()
    );
    assert_eq!(things.clear(&me).unwrap_err(), disconnected());
    f.settle();

    assert_eq!(things.to_list().await.unwrap(), before);
    assert_eq!(things.version().unwrap(), version);
    assert_eq!(things.state().unwrap(), SyncState::Full);
    assert_eq!(f.store.list(things.id()), before);
    assert!(o1.take().is_empty());

    // Once the connection is back the same writes go through.
    f.transport.heal();
    things.store(entity("e2"), keys(&["k2"]), &me).unwrap();
    f.settle();
    assert_eq!(o1.take(), vec!["update:things:+[e2]-[]:mine"]);
    assert_eq!(things.to_list().await.unwrap(), f.store.list(things.id()));
}

#[tokio::test]
async fn test_failed_variable_writes_change_nothing() {
    let f = FlakyHarness::new();
    let cell = f.engine.variable("cell").unwrap();
    let o1 = Recorder::new("o1");
    let me = ObserverId::new("o1");
    cell.register(o1.clone()).unwrap();
    f.settle();
    cell.set(entity("A"), &me).unwrap();
    f.settle();
    o1.take();

    f.transport.fail("set");
    f.transport.fail("clear");
    assert_eq!(cell.set(entity("B"), &me).unwrap_err(), disconnected());
    assert_eq!(cell.clear(&me).unwrap_err(), disconnected());
    f.settle();

    assert_eq!(cell.fetch().await.unwrap(), Some(entity("A")));
    assert_eq!(f.store.value(cell.id()), Some(entity("A")));
    assert!(o1.take().is_empty());

    // No barrier was left behind, so other writers are still heard.
    f.transport.heal();
    f.store
        .remote_set(cell.id(), Some(entity("C")), RemoteWrite::default());
    f.settle();
    assert_eq!(cell.fetch().await.unwrap(), Some(entity("C")));
    assert_eq!(o1.take(), vec!["update:cell:=C"]);
}

#[test]
fn test_failed_sync_request_leaves_observer_unregistered() {
    let f = FlakyHarness::new();
    let things = f.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");

    f.transport.fail("synchronize_proxy");
    assert_eq!(things.register(o1.clone()).unwrap_err(), disconnected());
    assert_eq!(things.state().unwrap(), SyncState::None);
    f.settle();
    assert!(o1.take().is_empty());

    f.transport.heal();
    f.store.take_requests();
    things.register(o1.clone()).unwrap();
    assert_eq!(things.state().unwrap(), SyncState::Pending);
    assert!(f
        .store
        .take_requests()
        .iter()
        .any(|r| matches!(r, StoreRequest::Synchronize { .. })));

    f.settle();
    assert_eq!(things.state().unwrap(), SyncState::Full);
    assert_eq!(o1.take(), vec!["sync:things:[]"]);
}

#[test]
fn test_failed_attach_is_retried_on_next_registration() {
    let f = FlakyHarness::new();
    let things = f.engine.collection("things").unwrap();
    let o1 = Recorder::new("o1");

    f.transport.fail("initialize_proxy");
    assert_eq!(things.register(o1.clone()).unwrap_err(), disconnected());
    assert_eq!(f.store.listener_count(things.id()), 0);

    f.transport.heal();
    things.register(o1.clone()).unwrap();
    assert_eq!(f.store.listener_count(things.id()), 1);
    f.settle();
    assert_eq!(o1.take(), vec!["sync:things:[]"]);
}

#[tokio::test]
async fn test_failed_streaming_store_changes_nothing() {
    let f = FlakyHarness::new();
    let big = f.engine.streaming("big").unwrap();
    let o1 = Recorder::new("o1");
    let me = ObserverId::new("o1");
    big.register(o1.clone()).unwrap();
    big.store(entity("i1"), keys(&["k1"]), &me).await.unwrap();
    f.settle();
    o1.take();

    f.transport.fail("stream_store");
    assert_eq!(
        big.store(entity("i2"), keys(&["k2"]), &me).await.unwrap_err(),
        disconnected()
    );
    f.settle();

    assert_eq!(f.store.list(big.id()), vec![entity("i1")]);
    assert!(o1.take().is_empty());
    let pages: Vec<Vec<Entity>> = big
        .stream(10, true)
        .await
        .unwrap()
        .into_stream()
        .map(|page| page.unwrap())
        .collect()
        .await;
    assert_eq!(pages, vec![vec![entity("i1")]]);
}

// ============================================================================
// Version monotonicity
// ============================================================================

/// Each op adds a fresh record and optionally removes it again.
fn delivery_strategy() -> impl Strategy<Value = (Vec<bool>, Vec<usize>)> {
    prop::collection::vec(any::<bool>(), 1..12).prop_flat_map(|ops| {
        let events = ops.len() + ops.iter().filter(|remove| **remove).count();
        (Just(ops), Just((0..events).collect::<Vec<_>>()).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn applied_versions_never_decrease((ops, order) in delivery_strategy()) {
        let h = Harness::new();
        let things = h.engine.collection("things").unwrap();
        things.register_with(Recorder::new("o1"), desync_options()).unwrap();
        h.store.respond_sync(things.id());
        h.settle();

        let mut events = Vec::new();
        for (n, remove) in ops.iter().enumerate() {
            let id = format!("e{}", n);
            events.push(
                h.store
                    .remote_store(things.id(), entity(&id), RemoteWrite::silent())
                    .unwrap(),
            );
            if *remove {
                events.extend(h.store.remote_remove(things.id(), &id, RemoteWrite::silent()));
            }
        }

        let mut last = Some(0);
        for i in order {
            h.store.deliver(things.id(), events[i].clone());
            h.settle();
            let version = things.version().unwrap();
            prop_assert!(version >= last);
            last = version;
        }

        prop_assert_eq!(things.version().unwrap(), Some(events.len() as u64));
        prop_assert_eq!(things.state().unwrap(), SyncState::Full);
        let local = futures::executor::block_on(things.to_list()).unwrap();
        prop_assert_eq!(local, h.store.list(things.id()));
    }
}

#[test]
fn test_engine_config_default_is_usable() {
    let store = Arc::new(MemoryStore::<Entity>::default());
    let scheduler =
        NotificationScheduler::with_spawner(Arc::new(strand_proxy::ManualSpawner::new()));
    let engine = StorageEngine::new(store, scheduler, EngineConfig::default());
    assert!(engine.config().replica_id.starts_with("replica-"));
    assert!(engine.collection("x").is_ok());
}

#[test]
fn test_model_entries_survive_a_round_trip_through_the_store() {
    let h = Harness::with_config(MemoryStoreConfig::default());
    let id = ProxyId::new("things");
    h.store
        .remote_store(
            &id,
            Entity::new("e1", json!({ "tags": ["a"] })),
            RemoteWrite {
                keys: keys(&["k1", "k2"]),
                ..RemoteWrite::default()
            },
        )
        .unwrap();

    let snapshot = h.store.snapshot(&id);
    assert_eq!(
        snapshot.model,
        vec![ModelEntry::new(
            "e1",
            Entity::new("e1", json!({ "tags": ["a"] })),
            keys(&["k1", "k2"])
        )]
    );
}

// File: `crates/strand-proxy/src/lib.rs`
//! Strand storage proxies.
//!
//! Observers read and write remote objects through proxies that keep a local,
//! eventually consistent copy of each object:
//!
//! - [`proxy`] - the versioned synchronization state machine and the
//!   collection, variable and streaming proxy kinds
//! - [`scheduler`] - deferred, ordered delivery of observer notifications
//! - [`engine`] - one proxy per object, typed handles, and the inbox through
//!   which the store answers
//! - [`transport`] - the interface to the authoritative store
//! - [`memory`] - an in-memory store for tests and simulations
//! - [`observer`] - callbacks, registration options and fault reporting
//! - [`event`] - ids and the messages exchanged with the store
//! - [`error`] - error types
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use strand_proxy::prelude::*;
//!
//! struct Printer(ObserverId);
//!
//! impl Observer<String> for Printer {
//!     fn id(&self) -> &ObserverId {
//!         &self.0
//!     }
//!
//!     fn on_sync(&self, proxy: &ProxyId, model: SyncModel<String>) -> ObserverResult {
//!         println!("{} synced: {:?}", proxy, model);
//!         Ok(())
//!     }
//! }
//!
//! let store = Arc::new(MemoryStore::<String>::default());
//! let spawner = ManualSpawner::new();
//! let scheduler = NotificationScheduler::with_spawner(Arc::new(spawner.clone()));
//! let engine = StorageEngine::new(store, scheduler, EngineConfig::default());
//!
//! let todos = engine.collection("todos").unwrap();
//! todos.register(Arc::new(Printer(ObserverId::new("printer")))).unwrap();
//! engine.pump().unwrap();
//! spawner.run_pending();
//!
//! assert_eq!(todos.state().unwrap(), SyncState::Full);
//! ```

pub mod engine;
pub mod error;
pub mod event;
pub mod memory;
pub mod observer;
pub mod proxy;
pub mod scheduler;
pub mod transport;

pub use engine::{
    CollectionHandle, EngineConfig, EngineConfigBuilder, StorageEngine, StreamingHandle,
    VariableHandle,
};
pub use error::{ObserverError, ProxyError, Result, TransportError};
pub use event::{
    Barrier, Inbound, ModelItem, ObserverId, ProxyId, ProxyListener, RemoteMessage,
    SyncResponse, UpdateBody, UpdateEvent, Version,
};
pub use memory::{MemoryStore, MemoryStoreConfig, RemoteWrite, StoreRequest};
pub use observer::{
    Change, FaultReporter, Notification, Observer, ObserverOptions, ObserverOptionsBuilder,
    ObserverResult, ObserverUpdate, SyncModel, TracingFaultReporter,
};
pub use proxy::{Cursor, ProxyKind, StorageProxy, SyncState};
pub use scheduler::{ManualSpawner, NotificationScheduler, Spawner, TokioSpawner};
pub use transport::{CursorId, CursorPage, RemoveRequest, Transport};

// Re-export the model types proxies are built on
pub use strand_core::{fresh_key, CrdtCollection, CrdtError, Entity, MembershipKey, ModelEntry, Record};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::engine::{EngineConfig, StorageEngine};
    pub use crate::error::ProxyError;
    pub use crate::event::{ObserverId, ProxyId};
    pub use crate::memory::MemoryStore;
    pub use crate::observer::{
        Change, Observer, ObserverOptions, ObserverResult, ObserverUpdate, SyncModel,
    };
    pub use crate::proxy::SyncState;
    pub use crate::scheduler::{ManualSpawner, NotificationScheduler};
    pub use strand_core::{Entity, Record};
}

//! The proxy engine.
//!
//! The engine owns one proxy per remote object and hands out handles that
//! carry only the object's id. Everything the store sends back lands in an
//! inbox and is applied by [`StorageEngine::pump`] or [`StorageEngine::run`].

use crate::error::{ProxyError, Result};
use crate::event::{Inbound, ObserverId, ProxyId, ProxyListener, RemoteMessage, Version};
use crate::observer::{Observer, ObserverOptions};
use crate::proxy::{
    CollectionProxy, Cursor, ProxyKind, StorageProxy, StreamingProxy, SyncState, VariableProxy,
};
use crate::scheduler::NotificationScheduler;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strand_core::{fresh_key, MembershipKey, Record};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Configuration for a storage engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Name used in logs.
    pub name: String,
    /// Prefix for membership keys minted by [`CollectionHandle::add`].
    pub replica_id: String,
    /// Options applied by the handles' `register`.
    pub default_options: ObserverOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "strand".to_string(),
            replica_id: format!("replica-{}", ulid::Ulid::new()),
            default_options: ObserverOptions::default(),
        }
    }
}

/// Builder for engine configuration.
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn replica_id(mut self, replica_id: impl Into<String>) -> Self {
        self.config.replica_id = replica_id.into();
        self
    }

    pub fn default_options(mut self, options: ObserverOptions) -> Self {
        self.config.default_options = options;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared<T: Record> {
    config: EngineConfig,
    transport: Arc<dyn Transport<T>>,
    scheduler: NotificationScheduler<T>,
    proxies: Mutex<HashMap<ProxyId, StorageProxy<T>>>,
    inbox_tx: mpsc::UnboundedSender<Inbound<T>>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound<T>>>,
}

/// Owns the proxies for one client of a store.
pub struct StorageEngine<T: Record> {
    shared: Arc<Shared<T>>,
}

impl<T: Record> Clone for StorageEngine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

fn mismatch(id: &ProxyId, expected: ProxyKind, found: ProxyKind) -> ProxyError {
    ProxyError::KindMismatch {
        proxy: id.clone(),
        expected,
        found,
    }
}

impl<T: Record> StorageEngine<T> {
    pub fn new(
        transport: Arc<dyn Transport<T>>,
        scheduler: NotificationScheduler<T>,
        config: EngineConfig,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                scheduler,
                proxies: Mutex::new(HashMap::new()),
                inbox_tx,
                inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn scheduler(&self) -> &NotificationScheduler<T> {
        &self.shared.scheduler
    }

    /// Handle to the collection `id`, creating its proxy if needed.
    pub fn collection(&self, id: impl Into<ProxyId>) -> Result<CollectionHandle<T>> {
        let id = id.into();
        self.ensure(&id, ProxyKind::Collection)?;
        Ok(CollectionHandle {
            engine: self.clone(),
            id,
        })
    }

    /// Handle to the variable `id`, creating its proxy if needed.
    pub fn variable(&self, id: impl Into<ProxyId>) -> Result<VariableHandle<T>> {
        let id = id.into();
        self.ensure(&id, ProxyKind::Variable)?;
        Ok(VariableHandle {
            engine: self.clone(),
            id,
        })
    }

    /// Handle to the streaming collection `id`, creating its proxy if needed.
    pub fn streaming(&self, id: impl Into<ProxyId>) -> Result<StreamingHandle<T>> {
        let id = id.into();
        self.ensure(&id, ProxyKind::Streaming)?;
        Ok(StreamingHandle {
            engine: self.clone(),
            id,
        })
    }

    pub fn contains(&self, id: &ProxyId) -> bool {
        self.shared.proxies.lock().contains_key(id)
    }

    pub fn state(&self, id: &ProxyId) -> Result<SyncState> {
        self.with_proxy(id, |proxy| Ok(proxy.state()))
    }

    pub fn version(&self, id: &ProxyId) -> Result<Option<Version>> {
        self.with_proxy(id, |proxy| Ok(proxy.version()))
    }

    /// A listener feeding this engine's inbox, for transports that deliver
    /// out of band.
    pub fn listener(&self, id: ProxyId) -> ProxyListener<T> {
        ProxyListener::new(id, self.shared.inbox_tx.clone())
    }

    /// Apply one message from the store.
    ///
    /// Messages for proxies that have since been dropped are ignored.
    pub fn deliver(&self, inbound: Inbound<T>) -> Result<()> {
        let mut proxies = self.shared.proxies.lock();
        let Some(proxy) = proxies.get_mut(&inbound.proxy_id) else {
            debug!(
                engine = %self.shared.config.name,
                proxy = %inbound.proxy_id,
                "ignoring message for dropped proxy"
            );
            return Ok(());
        };
        match inbound.message {
            RemoteMessage::Update(event) => proxy.on_update(event),
            RemoteMessage::Synchronized(response) => proxy.on_synchronize(response),
        }
    }

    /// Apply every message currently in the inbox. Returns how many were applied.
    ///
    /// Fails with [`ProxyError::InboxBusy`] while [`run`](Self::run) owns the
    /// inbox. The first failing message stops the drain; the rest stay queued.
    pub fn pump(&self) -> Result<usize> {
        let Ok(mut inbox) = self.shared.inbox_rx.try_lock() else {
            return Err(ProxyError::InboxBusy);
        };
        let mut applied = 0;
        while let Ok(inbound) = inbox.try_recv() {
            self.deliver(inbound)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Apply messages as they arrive, forever. Undeliverable messages are
    /// logged and skipped.
    pub async fn run(&self) -> Result<()> {
        let Ok(mut inbox) = self.shared.inbox_rx.try_lock() else {
            return Err(ProxyError::InboxBusy);
        };
        while let Some(inbound) = inbox.recv().await {
            if let Err(error) = self.deliver(inbound) {
                warn!(engine = %self.shared.config.name, %error, "dropping message");
            }
        }
        Ok(())
    }

    /// Pump the inbox and wait for notifications until both are quiet.
    ///
    /// Needs a scheduler whose flushes run without the caller's help, such as
    /// [`NotificationScheduler::tokio`].
    pub async fn settle(&self) -> Result<()> {
        loop {
            let applied = self.pump()?;
            self.shared.scheduler.idle().await;
            if applied == 0 {
                return Ok(());
            }
        }
    }

    fn ensure(&self, id: &ProxyId, kind: ProxyKind) -> Result<()> {
        let mut proxies = self.shared.proxies.lock();
        if let Some(proxy) = proxies.get(id) {
            if proxy.kind() != kind {
                return Err(mismatch(id, kind, proxy.kind()));
            }
            return Ok(());
        }
        debug!(engine = %self.shared.config.name, proxy = %id, %kind, "creating proxy");
        proxies.insert(
            id.clone(),
            StorageProxy::new(
                kind,
                id.clone(),
                self.shared.transport.clone(),
                self.shared.scheduler.clone(),
                self.listener(id.clone()),
            ),
        );
        Ok(())
    }

    fn register(
        &self,
        id: &ProxyId,
        kind: ProxyKind,
        observer: Arc<dyn Observer<T>>,
        options: ObserverOptions,
    ) -> Result<()> {
        self.ensure(id, kind)?;
        self.with_proxy(id, |proxy| proxy.register(observer, options))
    }

    fn deregister(&self, id: &ProxyId, observer: &ObserverId) {
        let mut proxies = self.shared.proxies.lock();
        let Some(proxy) = proxies.get_mut(id) else {
            return;
        };
        if !proxy.deregister(observer) {
            debug!(engine = %self.shared.config.name, proxy = %id, "dropping unobserved proxy");
            if let Err(error) = proxy.release() {
                warn!(engine = %self.shared.config.name, proxy = %id, %error, "detach failed");
            }
            proxies.remove(id);
        }
    }

    fn resynchronize(&self, id: &ProxyId) -> Result<()> {
        self.with_proxy(id, |proxy| proxy.resynchronize())
    }

    fn with_proxy<R>(
        &self,
        id: &ProxyId,
        f: impl FnOnce(&mut StorageProxy<T>) -> Result<R>,
    ) -> Result<R> {
        let mut proxies = self.shared.proxies.lock();
        let proxy = proxies
            .get_mut(id)
            .ok_or_else(|| ProxyError::UnknownProxy(id.clone()))?;
        f(proxy)
    }

    fn with_collection<R>(
        &self,
        id: &ProxyId,
        f: impl FnOnce(&mut CollectionProxy<T>) -> Result<R>,
    ) -> Result<R> {
        self.with_proxy(id, |proxy| match proxy {
            StorageProxy::Collection(collection) => f(collection),
            other => Err(mismatch(id, ProxyKind::Collection, other.kind())),
        })
    }

    fn with_variable<R>(
        &self,
        id: &ProxyId,
        f: impl FnOnce(&mut VariableProxy<T>) -> Result<R>,
    ) -> Result<R> {
        self.with_proxy(id, |proxy| match proxy {
            StorageProxy::Variable(variable) => f(variable),
            other => Err(mismatch(id, ProxyKind::Variable, other.kind())),
        })
    }

    fn with_streaming<R>(
        &self,
        id: &ProxyId,
        f: impl FnOnce(&mut StreamingProxy<T>) -> Result<R>,
    ) -> Result<R> {
        self.with_proxy(id, |proxy| match proxy {
            StorageProxy::Streaming(streaming) => f(streaming),
            other => Err(mismatch(id, ProxyKind::Streaming, other.kind())),
        })
    }
}

/// Handle to a collection proxy.
#[derive(Clone)]
pub struct CollectionHandle<T: Record> {
    engine: StorageEngine<T>,
    id: ProxyId,
}

impl<T: Record> CollectionHandle<T> {
    pub fn id(&self) -> &ProxyId {
        &self.id
    }

    /// Register with the engine's default options.
    pub fn register(&self, observer: Arc<dyn Observer<T>>) -> Result<()> {
        let options = self.engine.config().default_options;
        self.register_with(observer, options)
    }

    pub fn register_with(&self, observer: Arc<dyn Observer<T>>, options: ObserverOptions) -> Result<()> {
        self.engine
            .register(&self.id, ProxyKind::Collection, observer, options)
    }

    /// Remove `observer`; the proxy is dropped once nobody observes it.
    pub fn deregister(&self, observer: &ObserverId) {
        self.engine.deregister(&self.id, observer);
    }

    pub fn store(&self, value: T, keys: Vec<MembershipKey>, originator: &ObserverId) -> Result<()> {
        self.engine
            .with_collection(&self.id, |proxy| proxy.store(value, keys, originator))
    }

    /// Store `value` under a freshly minted key, returning the key.
    pub fn add(&self, value: T, originator: &ObserverId) -> Result<MembershipKey> {
        let key = fresh_key(&self.engine.config().replica_id);
        self.store(value, vec![key.clone()], originator)?;
        Ok(key)
    }

    pub fn remove(&self, id: &str, keys: Vec<MembershipKey>, originator: &ObserverId) -> Result<()> {
        self.engine
            .with_collection(&self.id, |proxy| proxy.remove(id, keys, originator))
    }

    pub fn clear(&self, originator: &ObserverId) -> Result<()> {
        self.engine
            .with_collection(&self.id, |proxy| proxy.clear(originator))
    }

    pub async fn to_list(&self) -> Result<Vec<T>> {
        let read = self
            .engine
            .with_collection(&self.id, |proxy| Ok(proxy.to_list()))?;
        read.await
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>> {
        let read = self
            .engine
            .with_collection(&self.id, |proxy| Ok(proxy.get(id)))?;
        read.await
    }

    pub fn state(&self) -> Result<SyncState> {
        self.engine.state(&self.id)
    }

    pub fn version(&self) -> Result<Option<Version>> {
        self.engine.version(&self.id)
    }

    pub fn resynchronize(&self) -> Result<()> {
        self.engine.resynchronize(&self.id)
    }
}

/// Handle to a variable proxy.
#[derive(Clone)]
pub struct VariableHandle<T: Record> {
    engine: StorageEngine<T>,
    id: ProxyId,
}

impl<T: Record> VariableHandle<T> {
    pub fn id(&self) -> &ProxyId {
        &self.id
    }

    /// Register with the engine's default options.
    pub fn register(&self, observer: Arc<dyn Observer<T>>) -> Result<()> {
        let options = self.engine.config().default_options;
        self.register_with(observer, options)
    }

    pub fn register_with(&self, observer: Arc<dyn Observer<T>>, options: ObserverOptions) -> Result<()> {
        self.engine
            .register(&self.id, ProxyKind::Variable, observer, options)
    }

    pub fn deregister(&self, observer: &ObserverId) {
        self.engine.deregister(&self.id, observer);
    }

    pub fn set(&self, value: T, originator: &ObserverId) -> Result<()> {
        self.engine
            .with_variable(&self.id, |proxy| proxy.set(value, originator))
    }

    pub fn clear(&self, originator: &ObserverId) -> Result<()> {
        self.engine
            .with_variable(&self.id, |proxy| proxy.clear(originator))
    }

    pub async fn fetch(&self) -> Result<Option<T>> {
        let read = self
            .engine
            .with_variable(&self.id, |proxy| Ok(proxy.fetch()))?;
        read.await
    }

    pub fn state(&self) -> Result<SyncState> {
        self.engine.state(&self.id)
    }

    pub fn version(&self) -> Result<Option<Version>> {
        self.engine.version(&self.id)
    }

    pub fn resynchronize(&self) -> Result<()> {
        self.engine.resynchronize(&self.id)
    }
}

/// Handle to a streaming proxy.
#[derive(Clone)]
pub struct StreamingHandle<T: Record> {
    engine: StorageEngine<T>,
    id: ProxyId,
}

impl<T: Record> StreamingHandle<T> {
    pub fn id(&self) -> &ProxyId {
        &self.id
    }

    pub fn register(&self, observer: Arc<dyn Observer<T>>) -> Result<()> {
        let options = self.engine.config().default_options;
        self.engine
            .register(&self.id, ProxyKind::Streaming, observer, options)
    }

    pub fn deregister(&self, observer: &ObserverId) {
        self.engine.deregister(&self.id, observer);
    }

    pub async fn store(&self, value: T, keys: Vec<MembershipKey>, originator: &ObserverId) -> Result<()> {
        let write = self
            .engine
            .with_streaming(&self.id, |proxy| Ok(proxy.store(value, keys, originator)))?;
        write.await
    }

    pub async fn remove(&self, id: &str, originator: &ObserverId) -> Result<()> {
        let write = self
            .engine
            .with_streaming(&self.id, |proxy| Ok(proxy.remove(id, originator)))?;
        write.await
    }

    /// Open a paginated cursor over a snapshot of the collection.
    pub async fn stream(&self, page_size: usize, forward: bool) -> Result<Cursor<T>> {
        let open = self
            .engine
            .with_streaming(&self.id, |proxy| Ok(proxy.stream(page_size, forward)))?;
        open.await
    }
}

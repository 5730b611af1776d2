//! Storage proxies.
//!
//! A proxy mediates between the observers of one remote object and the store
//! that owns it. Observers registered with `keep_synced` make the proxy hold a
//! full local copy, kept current by versioned update events:
//!
//! - an event one version ahead of the local copy is applied immediately;
//! - an event from further ahead is queued, and a proxy that was fully
//!   synchronized asks the store for the whole model again;
//! - queued events that become applicable are applied while that request is
//!   in flight, so the proxy may catch up before the response arrives;
//! - once the response lands, queued events it already covers are dropped and
//!   the rest are applied.
//!
//! Observers without `keep_synced` but with `notify_update` see every incoming
//! event as it arrives, derived from the event alone.

mod collection;
mod streaming;
mod variable;

pub use collection::{CollectionProxy, CollectionState};
pub use streaming::{Cursor, StreamingProxy};
pub use variable::{VariableProxy, VariableState};

use crate::error::{ProxyError, Result};
use crate::event::{
    ObserverId, ProxyId, ProxyListener, SyncResponse, UpdateBody, UpdateEvent, Version,
};
use crate::observer::{Change, Notification, Observer, ObserverOptions, SyncModel};
use crate::scheduler::NotificationScheduler;
use crate::transport::Transport;
use std::sync::Arc;
use strand_core::{ModelEntry, Record};
use tracing::{debug, warn};

/// How far a proxy's local copy can be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Not tracking the remote object, or known to be behind it.
    None,
    /// A full-model request is in flight.
    Pending,
    /// The local copy reflects every event up to `version`.
    Full,
}

/// The shape of the remote object a proxy stands in for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Collection,
    Variable,
    Streaming,
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProxyKind::Collection => "collection",
            ProxyKind::Variable => "variable",
            ProxyKind::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// One observer's registration with a proxy.
#[derive(Clone)]
pub struct Registration<T: Record> {
    pub observer: Arc<dyn Observer<T>>,
    pub options: ObserverOptions,
}

impl<T: Record> std::fmt::Debug for Registration<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("observer", self.observer.id())
            .field("options", &self.options)
            .finish()
    }
}

/// State shared by every synchronized proxy kind.
pub struct ProxyCore<T: Record> {
    id: ProxyId,
    transport: Arc<dyn Transport<T>>,
    scheduler: NotificationScheduler<T>,
    listener: ProxyListener<T>,
    version: Option<Version>,
    listener_attached: bool,
    keep_synced: bool,
    state: SyncState,
    registrations: Vec<Registration<T>>,
    /// Events waiting for their predecessors, sorted by version.
    updates: Vec<UpdateEvent<T>>,
}

impl<T: Record> ProxyCore<T> {
    fn new(
        id: ProxyId,
        transport: Arc<dyn Transport<T>>,
        scheduler: NotificationScheduler<T>,
        listener: ProxyListener<T>,
    ) -> Self {
        Self {
            id,
            transport,
            scheduler,
            listener,
            version: None,
            listener_attached: false,
            keep_synced: false,
            state: SyncState::None,
            registrations: Vec::new(),
            updates: Vec::new(),
        }
    }

    /// Queue `notification` for every registration matching `filter`.
    fn notify(&self, notification: Notification<T>, filter: impl Fn(&ObserverOptions) -> bool) {
        for registration in &self.registrations {
            if filter(&registration.options) {
                self.scheduler
                    .enqueue(&registration.observer, &self.id, notification.clone());
            }
        }
    }

    fn notify_update(
        &self,
        change: Change<T>,
        originator: Option<ObserverId>,
        filter: impl Fn(&ObserverOptions) -> bool,
    ) {
        self.notify(
            Notification::Update {
                change,
                originator_id: originator,
            },
            filter,
        );
    }

    fn request_sync(&self) -> Result<()> {
        debug!(proxy = %self.id, version = ?self.version, "requesting full model");
        self.transport
            .synchronize_proxy(&self.id, self.listener.clone())?;
        Ok(())
    }

    fn is_registered(&self, observer: &ObserverId) -> bool {
        self.registrations
            .iter()
            .any(|registration| registration.observer.id() == observer)
    }

    fn has_pass_through(&self) -> bool {
        self.registrations
            .iter()
            .any(|r| !r.options.keep_synced && r.options.notify_update)
    }
}

/// The kind-specific half of a synchronized proxy.
pub trait ProxyModel<T: Record>: Default + Send + 'static {
    const KIND: ProxyKind;

    /// Whether events of this form make sense for this kind.
    fn accepts(body: &UpdateBody<T>) -> bool;

    /// The model handed to `on_sync`.
    fn sync_model(&self) -> SyncModel<T>;

    /// Replace the local copy with a full model. Returns `false` to refuse it.
    fn synchronize(&mut self, model: Vec<ModelEntry<T>>) -> bool;

    /// Fold `event` into the local copy (`apply`), or derive what it changed
    /// from the event alone (`!apply`). `None` means there is nothing to notify.
    fn process_update(
        &mut self,
        core: &mut ProxyCore<T>,
        event: &UpdateEvent<T>,
        apply: bool,
    ) -> Option<Change<T>>;

    /// An event that answers an in-flight local write, whatever its version.
    fn is_barrier_ack(&self, _event: &UpdateEvent<T>) -> bool {
        false
    }
}

/// A proxy that can mirror its remote object.
pub struct SyncedProxy<T: Record, M> {
    core: ProxyCore<T>,
    model: M,
}

impl<T: Record, M: ProxyModel<T>> SyncedProxy<T, M> {
    pub fn new(
        id: ProxyId,
        transport: Arc<dyn Transport<T>>,
        scheduler: NotificationScheduler<T>,
        listener: ProxyListener<T>,
    ) -> Self {
        Self {
            core: ProxyCore::new(id, transport, scheduler, listener),
            model: M::default(),
        }
    }

    pub fn id(&self) -> &ProxyId {
        &self.core.id
    }

    pub fn state(&self) -> SyncState {
        self.core.state
    }

    pub fn version(&self) -> Option<Version> {
        self.core.version
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn registrations(&self) -> &[Registration<T>] {
        &self.core.registrations
    }

    /// Events held back waiting for a predecessor.
    pub fn queued(&self) -> usize {
        self.core.updates.len()
    }

    pub fn register(
        &mut self,
        observer: Arc<dyn Observer<T>>,
        options: ObserverOptions,
    ) -> Result<()> {
        if self.core.is_registered(observer.id()) {
            return Err(ProxyError::AlreadyRegistered {
                proxy: self.core.id.clone(),
                observer: observer.id().clone(),
            });
        }

        if !self.core.listener_attached {
            self.core
                .transport
                .initialize_proxy(&self.core.id, self.core.listener.clone())?;
            self.core.listener_attached = true;
        }

        // Nothing is recorded until the store has taken every request.
        if options.keep_synced && !self.core.keep_synced {
            self.core.request_sync()?;
            self.core.keep_synced = true;
            self.core.state = SyncState::Pending;
        }

        if options.keep_synced && options.notify_sync && self.core.state == SyncState::Full {
            self.core.scheduler.enqueue(
                &observer,
                &self.core.id,
                Notification::Sync(self.model.sync_model()),
            );
        }
        self.core
            .registrations
            .push(Registration { observer, options });
        Ok(())
    }

    /// Stop the store's event delivery, if it was ever started.
    pub fn release(&mut self) -> Result<()> {
        if self.core.listener_attached {
            self.core
                .transport
                .detach_proxy(&self.core.id, &self.core.listener)?;
            self.core.listener_attached = false;
        }
        Ok(())
    }

    /// Drop `observer`'s registration. Returns whether any registrations remain.
    pub fn deregister(&mut self, observer: &ObserverId) -> bool {
        self.core
            .registrations
            .retain(|registration| registration.observer.id() != observer);
        !self.core.registrations.is_empty()
    }

    /// Ask the store for the full model again.
    ///
    /// A fully synchronized proxy stays usable while the request is in flight;
    /// a response no newer than the local copy is discarded as stale.
    pub fn resynchronize(&mut self) -> Result<()> {
        if !self.core.keep_synced {
            return Ok(());
        }
        self.core.request_sync()?;
        if self.core.state != SyncState::Full {
            self.core.state = SyncState::Pending;
        }
        Ok(())
    }

    pub fn on_synchronize(&mut self, response: SyncResponse<T>) -> Result<()> {
        if let Some(current) = self.core.version {
            if response.version <= current {
                warn!(
                    proxy = %self.core.id,
                    version = response.version,
                    current,
                    "discarding stale model"
                );
                return Ok(());
            }
        }

        if !self.model.synchronize(response.model) {
            debug!(proxy = %self.core.id, version = response.version, "model refused");
            return Ok(());
        }

        self.core.version = Some(response.version);
        self.core.state = SyncState::Full;
        let covered = self
            .core
            .updates
            .partition_point(|update| update.version <= response.version);
        self.core.updates.drain(..covered);

        self.core.notify(Notification::Sync(self.model.sync_model()), |o| {
            o.keep_synced && o.notify_sync
        });
        self.process_updates()
    }

    pub fn on_update(&mut self, event: UpdateEvent<T>) -> Result<()> {
        if !M::accepts(&event.body) {
            return Err(ProxyError::MalformedUpdate {
                proxy: self.core.id.clone(),
                reason: format!("{} proxies do not accept this event form", M::KIND),
            });
        }

        if self.core.has_pass_through() {
            if let Some(change) = self.model.process_update(&mut self.core, &event, false) {
                self.core
                    .notify_update(change, event.originator_id.clone(), |o| {
                        !o.keep_synced && o.notify_update
                    });
            }
        }

        if !self.core.keep_synced {
            return Ok(());
        }
        if let Some(current) = self.core.version {
            if event.version <= current {
                warn!(
                    proxy = %self.core.id,
                    version = event.version,
                    current,
                    "discarding stale update"
                );
                return Ok(());
            }
        }

        let at = self
            .core
            .updates
            .partition_point(|queued| queued.version <= event.version);
        self.core.updates.insert(at, event);
        self.process_updates()
    }

    fn next_applicable(&self) -> Option<usize> {
        let head = self.core.updates.first()?;
        if self.core.version.map(|v| v + 1) == Some(head.version) {
            return Some(0);
        }
        self.core
            .updates
            .iter()
            .position(|update| self.model.is_barrier_ack(update))
    }

    fn process_updates(&mut self) -> Result<()> {
        loop {
            if let Some(current) = self.core.version {
                let stale = self
                    .core
                    .updates
                    .partition_point(|update| update.version <= current);
                self.core.updates.drain(..stale);
            }

            let Some(at) = self.next_applicable() else {
                break;
            };
            if at > 0 {
                debug!(
                    proxy = %self.core.id,
                    superseded = at,
                    "dropping events superseded by a local write"
                );
            }
            let event = self.core.updates.remove(at);
            self.core.updates.drain(..at);

            let change = self.model.process_update(&mut self.core, &event, true);
            self.core.version = Some(event.version);
            if let Some(change) = change {
                self.core.notify_update(change, event.originator_id, |o| {
                    o.keep_synced && o.notify_update
                });
            }
        }

        if !self.core.updates.is_empty() {
            if self.core.state == SyncState::Full {
                debug!(
                    proxy = %self.core.id,
                    version = ?self.core.version,
                    next = self.core.updates[0].version,
                    "desynchronized"
                );
                self.core.state = SyncState::None;
                self.core.notify(Notification::Desync, |o| o.notify_desync);
            }
            if self.core.state == SyncState::None {
                self.core.request_sync()?;
                self.core.state = SyncState::Pending;
            }
        } else if self.core.state != SyncState::Full && self.core.version.is_some() {
            self.core.state = SyncState::Full;
            self.core.notify(Notification::Sync(self.model.sync_model()), |o| {
                o.keep_synced && o.notify_sync
            });
        }
        Ok(())
    }
}

/// Any proxy held by the engine.
pub enum StorageProxy<T: Record> {
    Collection(CollectionProxy<T>),
    Variable(VariableProxy<T>),
    Streaming(StreamingProxy<T>),
}

impl<T: Record> StorageProxy<T> {
    pub fn new(
        kind: ProxyKind,
        id: ProxyId,
        transport: Arc<dyn Transport<T>>,
        scheduler: NotificationScheduler<T>,
        listener: ProxyListener<T>,
    ) -> Self {
        match kind {
            ProxyKind::Collection => {
                StorageProxy::Collection(SyncedProxy::new(id, transport, scheduler, listener))
            }
            ProxyKind::Variable => {
                StorageProxy::Variable(SyncedProxy::new(id, transport, scheduler, listener))
            }
            ProxyKind::Streaming => {
                StorageProxy::Streaming(StreamingProxy::new(id, transport, scheduler))
            }
        }
    }

    pub fn kind(&self) -> ProxyKind {
        match self {
            StorageProxy::Collection(_) => ProxyKind::Collection,
            StorageProxy::Variable(_) => ProxyKind::Variable,
            StorageProxy::Streaming(_) => ProxyKind::Streaming,
        }
    }

    pub fn id(&self) -> &ProxyId {
        match self {
            StorageProxy::Collection(proxy) => proxy.id(),
            StorageProxy::Variable(proxy) => proxy.id(),
            StorageProxy::Streaming(proxy) => proxy.id(),
        }
    }

    pub fn state(&self) -> SyncState {
        match self {
            StorageProxy::Collection(proxy) => proxy.state(),
            StorageProxy::Variable(proxy) => proxy.state(),
            StorageProxy::Streaming(_) => SyncState::None,
        }
    }

    pub fn version(&self) -> Option<Version> {
        match self {
            StorageProxy::Collection(proxy) => proxy.version(),
            StorageProxy::Variable(proxy) => proxy.version(),
            StorageProxy::Streaming(_) => None,
        }
    }

    pub fn register(
        &mut self,
        observer: Arc<dyn Observer<T>>,
        options: ObserverOptions,
    ) -> Result<()> {
        match self {
            StorageProxy::Collection(proxy) => proxy.register(observer, options),
            StorageProxy::Variable(proxy) => proxy.register(observer, options),
            StorageProxy::Streaming(proxy) => proxy.register(observer),
        }
    }

    pub fn deregister(&mut self, observer: &ObserverId) -> bool {
        match self {
            StorageProxy::Collection(proxy) => proxy.deregister(observer),
            StorageProxy::Variable(proxy) => proxy.deregister(observer),
            StorageProxy::Streaming(proxy) => proxy.deregister(observer),
        }
    }

    /// Detach from the store before the proxy is dropped.
    pub fn release(&mut self) -> Result<()> {
        match self {
            StorageProxy::Collection(proxy) => proxy.release(),
            StorageProxy::Variable(proxy) => proxy.release(),
            StorageProxy::Streaming(_) => Ok(()),
        }
    }

    pub fn resynchronize(&mut self) -> Result<()> {
        match self {
            StorageProxy::Collection(proxy) => proxy.resynchronize(),
            StorageProxy::Variable(proxy) => proxy.resynchronize(),
            StorageProxy::Streaming(_) => Ok(()),
        }
    }

    pub fn on_update(&mut self, event: UpdateEvent<T>) -> Result<()> {
        match self {
            StorageProxy::Collection(proxy) => proxy.on_update(event),
            StorageProxy::Variable(proxy) => proxy.on_update(event),
            StorageProxy::Streaming(proxy) => Err(ProxyError::MalformedUpdate {
                proxy: proxy.id().clone(),
                reason: "streaming proxies are never synchronized".to_string(),
            }),
        }
    }

    pub fn on_synchronize(&mut self, response: SyncResponse<T>) -> Result<()> {
        match self {
            StorageProxy::Collection(proxy) => proxy.on_synchronize(response),
            StorageProxy::Variable(proxy) => proxy.on_synchronize(response),
            StorageProxy::Streaming(proxy) => {
                warn!(proxy = %proxy.id(), "ignoring model sent to a streaming proxy");
                Ok(())
            }
        }
    }
}

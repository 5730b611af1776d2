//! In-memory authoritative store.
//!
//! Implements [`Transport`] against plain data so proxies can be exercised
//! without a real backend. Remote-side helpers write as another client would,
//! and can withhold the resulting event to simulate loss or reordering.

use crate::error::{Result, TransportError};
use crate::event::{
    Barrier, ModelItem, ObserverId, ProxyId, ProxyListener, SyncResponse, UpdateEvent, Version,
};
use crate::transport::{CursorId, CursorPage, RemoveRequest, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use strand_core::{fresh_key, CrdtCollection, MembershipKey, ModelEntry, Record};
use tracing::debug;

/// Configuration for a memory store.
#[derive(Clone, Debug)]
pub struct MemoryStoreConfig {
    /// Answer full-model requests as soon as they arrive.
    pub auto_sync: bool,
    /// Prefix for membership keys minted by remote writes.
    pub replica_id: String,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            replica_id: "store".to_string(),
        }
    }
}

/// How a remote-side write is published.
#[derive(Clone, Debug)]
pub struct RemoteWrite {
    /// Deliver the resulting event to listeners. When `false` the event is
    /// only returned to the caller.
    pub send_event: bool,
    /// Version to stamp on the event instead of the next one.
    pub version: Option<Version>,
    pub originator: Option<ObserverId>,
    pub barrier: Option<Barrier>,
    /// Keys to write under; a fresh key is minted when empty.
    pub keys: Vec<MembershipKey>,
}

impl Default for RemoteWrite {
    fn default() -> Self {
        Self {
            send_event: true,
            version: None,
            originator: None,
            barrier: None,
            keys: Vec::new(),
        }
    }
}

impl RemoteWrite {
    /// A write whose event is withheld.
    pub fn silent() -> Self {
        Self {
            send_event: false,
            ..Self::default()
        }
    }
}

/// Every request the store has received, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreRequest<T> {
    Initialize {
        proxy: ProxyId,
    },
    Detach {
        proxy: ProxyId,
    },
    Synchronize {
        proxy: ProxyId,
    },
    Store {
        proxy: ProxyId,
        value: T,
        keys: Vec<MembershipKey>,
        originator: ObserverId,
    },
    Remove {
        proxy: ProxyId,
        record_id: String,
        keys: Vec<MembershipKey>,
        originator: ObserverId,
    },
    RemoveMultiple {
        proxy: ProxyId,
        items: Vec<RemoveRequest>,
        originator: ObserverId,
    },
    Set {
        proxy: ProxyId,
        value: T,
        originator: ObserverId,
        barrier: Option<Barrier>,
    },
    Clear {
        proxy: ProxyId,
        originator: ObserverId,
        barrier: Option<Barrier>,
    },
    Get {
        proxy: ProxyId,
    },
    ToList {
        proxy: ProxyId,
    },
    Stream {
        proxy: ProxyId,
        page_size: usize,
        forward: bool,
    },
    CursorNext {
        proxy: ProxyId,
        cursor: CursorId,
    },
    CursorClose {
        proxy: ProxyId,
        cursor: CursorId,
    },
}

struct StoredObject<T: Record> {
    version: Version,
    collection: CrdtCollection<T>,
    cell: Option<T>,
    listeners: Vec<ProxyListener<T>>,
}

impl<T: Record> Default for StoredObject<T> {
    fn default() -> Self {
        Self {
            version: 0,
            collection: CrdtCollection::new(),
            cell: None,
            listeners: Vec::new(),
        }
    }
}

impl<T: Record> StoredObject<T> {
    fn snapshot(&self) -> SyncResponse<T> {
        let model = match &self.cell {
            Some(value) => vec![ModelEntry::new(value.id(), value.clone(), Vec::new())],
            None => self.collection.to_literal(),
        };
        SyncResponse {
            version: self.version,
            model,
        }
    }

    fn stamp(&mut self, version: Option<Version>) -> Version {
        self.version = version.unwrap_or(self.version + 1);
        self.version
    }

    fn publish(&self, proxy: &ProxyId, event: &UpdateEvent<T>) {
        for listener in &self.listeners {
            if listener.update(event.clone()).is_err() {
                debug!(%proxy, "listener gone; dropping event");
            }
        }
    }

    fn add(&mut self, value: T, keys: Vec<MembershipKey>) -> Result<ModelItem<T>> {
        let effective = self.collection.add(value.id(), value.clone(), &keys)?;
        Ok(ModelItem::new(value, keys, effective))
    }

    /// `None` when the record is unknown.
    fn remove(&mut self, record_id: &str, keys: Vec<MembershipKey>) -> Option<ModelItem<T>> {
        let value = self.collection.get_value(record_id)?.clone();
        let keys = if keys.is_empty() {
            self.collection.get_keys(record_id)
        } else {
            keys
        };
        let effective = self.collection.remove(record_id, &keys);
        Some(ModelItem::new(value, keys, effective))
    }

    fn remove_all(&mut self, items: Vec<RemoveRequest>) -> Vec<ModelItem<T>> {
        let items = if items.is_empty() {
            self.collection
                .iter()
                .map(|(id, _)| RemoveRequest {
                    id: id.to_string(),
                    keys: Vec::new(),
                })
                .collect()
        } else {
            items
        };
        items
            .into_iter()
            .filter_map(|item| self.remove(&item.id, item.keys))
            .collect()
    }
}

struct OpenCursor<T> {
    proxy: ProxyId,
    remaining: VecDeque<T>,
    page_size: usize,
}

struct StoreState<T: Record> {
    objects: HashMap<ProxyId, StoredObject<T>>,
    pending_syncs: Vec<ProxyListener<T>>,
    cursors: HashMap<CursorId, OpenCursor<T>>,
    next_cursor: CursorId,
    requests: Vec<StoreRequest<T>>,
}

/// An in-memory store shared by any number of engines.
pub struct MemoryStore<T: Record> {
    config: MemoryStoreConfig,
    state: Mutex<StoreState<T>>,
}

impl<T: Record> MemoryStore<T> {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            config,
            state: Mutex::new(StoreState {
                objects: HashMap::new(),
                pending_syncs: Vec::new(),
                cursors: HashMap::new(),
                next_cursor: 1,
                requests: Vec::new(),
            }),
        }
    }

    pub fn config(&self) -> &MemoryStoreConfig {
        &self.config
    }

    fn keys_for(&self, write: &RemoteWrite) -> Vec<MembershipKey> {
        if write.keys.is_empty() {
            vec![fresh_key(&self.config.replica_id)]
        } else {
            write.keys.clone()
        }
    }

    fn finish(object: &StoredObject<T>, proxy: &ProxyId, event: UpdateEvent<T>, send: bool) -> UpdateEvent<T> {
        if send {
            object.publish(proxy, &event);
        }
        event
    }

    /// Add `value` to a collection as another client would.
    pub fn remote_store(&self, proxy: &ProxyId, value: T, write: RemoteWrite) -> Result<UpdateEvent<T>> {
        let keys = self.keys_for(&write);
        let mut state = self.state.lock();
        let object = state.objects.entry(proxy.clone()).or_default();
        let item = object.add(value, keys)?;
        let version = object.stamp(write.version);
        let event = UpdateEvent::add(version, vec![item]).with_originator(write.originator);
        Ok(Self::finish(object, proxy, event, write.send_event))
    }

    /// Remove `record_id` from a collection; `write.keys` empty removes every key.
    /// `None` when the record is unknown.
    pub fn remote_remove(
        &self,
        proxy: &ProxyId,
        record_id: &str,
        write: RemoteWrite,
    ) -> Option<UpdateEvent<T>> {
        let mut state = self.state.lock();
        let object = state.objects.entry(proxy.clone()).or_default();
        let item = object.remove(record_id, write.keys)?;
        let version = object.stamp(write.version);
        let event = UpdateEvent::remove(version, vec![item]).with_originator(write.originator);
        Some(Self::finish(object, proxy, event, write.send_event))
    }

    /// Replace a variable's value; `None` clears it.
    pub fn remote_set(&self, proxy: &ProxyId, value: Option<T>, write: RemoteWrite) -> UpdateEvent<T> {
        let mut state = self.state.lock();
        let object = state.objects.entry(proxy.clone()).or_default();
        object.cell = value.clone();
        let version = object.stamp(write.version);
        let event =
            UpdateEvent::data(version, value, write.barrier).with_originator(write.originator);
        Self::finish(object, proxy, event, write.send_event)
    }

    /// Empty a collection.
    pub fn remote_clear(&self, proxy: &ProxyId, write: RemoteWrite) -> Option<UpdateEvent<T>> {
        let mut state = self.state.lock();
        let object = state.objects.entry(proxy.clone()).or_default();
        let items = object.remove_all(Vec::new());
        if items.is_empty() {
            return None;
        }
        let version = object.stamp(write.version);
        let event = UpdateEvent::remove(version, items).with_originator(write.originator);
        Some(Self::finish(object, proxy, event, write.send_event))
    }

    /// Hand a previously withheld event to every listener of `proxy`.
    pub fn deliver(&self, proxy: &ProxyId, event: UpdateEvent<T>) {
        let state = self.state.lock();
        if let Some(object) = state.objects.get(proxy) {
            object.publish(proxy, &event);
        }
    }

    /// The full-model response the store would send right now.
    pub fn snapshot(&self, proxy: &ProxyId) -> SyncResponse<T> {
        let state = self.state.lock();
        state
            .objects
            .get(proxy)
            .map(StoredObject::snapshot)
            .unwrap_or(SyncResponse {
                version: 0,
                model: Vec::new(),
            })
    }

    /// Answer queued full-model requests for `proxy` with the current model.
    pub fn respond_sync(&self, proxy: &ProxyId) -> usize {
        let response = self.snapshot(proxy);
        self.respond_sync_with(proxy, response)
    }

    /// Answer queued full-model requests for `proxy` with `response`.
    pub fn respond_sync_with(&self, proxy: &ProxyId, response: SyncResponse<T>) -> usize {
        let waiting: Vec<_> = {
            let mut state = self.state.lock();
            let (waiting, rest) = std::mem::take(&mut state.pending_syncs)
                .into_iter()
                .partition(|listener| listener.proxy_id() == proxy);
            state.pending_syncs = rest;
            waiting
        };
        for listener in &waiting {
            if listener.synchronized(response.clone()).is_err() {
                debug!(%proxy, "listener gone; dropping model");
            }
        }
        waiting.len()
    }

    /// Listeners currently receiving events for `proxy`.
    pub fn listener_count(&self, proxy: &ProxyId) -> usize {
        self.state
            .lock()
            .objects
            .get(proxy)
            .map_or(0, |object| object.listeners.len())
    }

    /// Unanswered full-model requests for `proxy`.
    pub fn pending_syncs(&self, proxy: &ProxyId) -> usize {
        self.state
            .lock()
            .pending_syncs
            .iter()
            .filter(|listener| listener.proxy_id() == proxy)
            .count()
    }

    pub fn version(&self, proxy: &ProxyId) -> Version {
        self.state
            .lock()
            .objects
            .get(proxy)
            .map_or(0, |object| object.version)
    }

    pub fn list(&self, proxy: &ProxyId) -> Vec<T> {
        self.state
            .lock()
            .objects
            .get(proxy)
            .map(|object| object.collection.to_list())
            .unwrap_or_default()
    }

    pub fn value(&self, proxy: &ProxyId) -> Option<T> {
        self.state
            .lock()
            .objects
            .get(proxy)
            .and_then(|object| object.cell.clone())
    }

    /// Drain the request log.
    pub fn take_requests(&self) -> Vec<StoreRequest<T>> {
        std::mem::take(&mut self.state.lock().requests)
    }

    fn record(&self, request: StoreRequest<T>) {
        self.state.lock().requests.push(request);
    }

    fn apply_store(
        &self,
        proxy: &ProxyId,
        value: T,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> std::result::Result<(), TransportError> {
        let mut state = self.state.lock();
        state.requests.push(StoreRequest::Store {
            proxy: proxy.clone(),
            value: value.clone(),
            keys: keys.clone(),
            originator: originator.clone(),
        });
        let object = state.objects.entry(proxy.clone()).or_default();
        let item = object
            .add(value, keys)
            .map_err(|error| TransportError::Rejected(error.to_string()))?;
        let version = object.stamp(None);
        let event = UpdateEvent::add(version, vec![item]).with_originator(Some(originator.clone()));
        object.publish(proxy, &event);
        Ok(())
    }

    fn apply_remove(
        &self,
        proxy: &ProxyId,
        items: Vec<RemoveRequest>,
        originator: &ObserverId,
    ) {
        let mut state = self.state.lock();
        let object = state.objects.entry(proxy.clone()).or_default();
        let items = object.remove_all(items);
        if items.is_empty() {
            return;
        }
        let version = object.stamp(None);
        let event = UpdateEvent::remove(version, items).with_originator(Some(originator.clone()));
        object.publish(proxy, &event);
    }

    fn apply_set(
        &self,
        proxy: &ProxyId,
        value: Option<T>,
        originator: &ObserverId,
        barrier: Option<Barrier>,
    ) {
        let mut state = self.state.lock();
        let object = state.objects.entry(proxy.clone()).or_default();
        object.cell = value.clone();
        let version = object.stamp(None);
        let event = UpdateEvent::data(version, value, barrier).with_originator(Some(originator.clone()));
        object.publish(proxy, &event);
    }
}

impl<T: Record> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

#[async_trait]
impl<T: Record> Transport<T> for MemoryStore<T> {
    fn initialize_proxy(
        &self,
        id: &ProxyId,
        listener: ProxyListener<T>,
    ) -> std::result::Result<(), TransportError> {
        let mut state = self.state.lock();
        state
            .requests
            .push(StoreRequest::Initialize { proxy: id.clone() });
        let listeners = &mut state.objects.entry(id.clone()).or_default().listeners;
        if !listeners.iter().any(|known| known.same_target(&listener)) {
            listeners.push(listener);
        }
        Ok(())
    }

    fn detach_proxy(
        &self,
        id: &ProxyId,
        listener: &ProxyListener<T>,
    ) -> std::result::Result<(), TransportError> {
        let mut state = self.state.lock();
        state.requests.push(StoreRequest::Detach { proxy: id.clone() });
        if let Some(object) = state.objects.get_mut(id) {
            object.listeners.retain(|known| !known.same_target(listener));
        }
        state.pending_syncs.retain(|waiting| !waiting.same_target(listener));
        Ok(())
    }

    fn synchronize_proxy(
        &self,
        id: &ProxyId,
        listener: ProxyListener<T>,
    ) -> std::result::Result<(), TransportError> {
        let response = {
            let mut state = self.state.lock();
            state
                .requests
                .push(StoreRequest::Synchronize { proxy: id.clone() });
            if !self.config.auto_sync {
                state.pending_syncs.push(listener);
                return Ok(());
            }
            state
                .objects
                .get(id)
                .map(StoredObject::snapshot)
                .unwrap_or(SyncResponse {
                    version: 0,
                    model: Vec::new(),
                })
        };
        listener.synchronized(response)
    }

    fn store(
        &self,
        id: &ProxyId,
        value: T,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> std::result::Result<(), TransportError> {
        self.apply_store(id, value, keys, originator)
    }

    fn remove(
        &self,
        id: &ProxyId,
        record_id: &str,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> std::result::Result<(), TransportError> {
        self.record(StoreRequest::Remove {
            proxy: id.clone(),
            record_id: record_id.to_string(),
            keys: keys.clone(),
            originator: originator.clone(),
        });
        let item = RemoveRequest {
            id: record_id.to_string(),
            keys,
        };
        self.apply_remove(id, vec![item], originator);
        Ok(())
    }

    fn remove_multiple(
        &self,
        id: &ProxyId,
        items: Vec<RemoveRequest>,
        originator: &ObserverId,
    ) -> std::result::Result<(), TransportError> {
        self.record(StoreRequest::RemoveMultiple {
            proxy: id.clone(),
            items: items.clone(),
            originator: originator.clone(),
        });
        self.apply_remove(id, items, originator);
        Ok(())
    }

    fn set(
        &self,
        id: &ProxyId,
        value: T,
        originator: &ObserverId,
        barrier: Option<Barrier>,
    ) -> std::result::Result<(), TransportError> {
        self.record(StoreRequest::Set {
            proxy: id.clone(),
            value: value.clone(),
            originator: originator.clone(),
            barrier: barrier.clone(),
        });
        self.apply_set(id, Some(value), originator, barrier);
        Ok(())
    }

    fn clear(
        &self,
        id: &ProxyId,
        originator: &ObserverId,
        barrier: Option<Barrier>,
    ) -> std::result::Result<(), TransportError> {
        self.record(StoreRequest::Clear {
            proxy: id.clone(),
            originator: originator.clone(),
            barrier: barrier.clone(),
        });
        self.apply_set(id, None, originator, barrier);
        Ok(())
    }

    fn cursor_close(&self, id: &ProxyId, cursor: CursorId) -> std::result::Result<(), TransportError> {
        let mut state = self.state.lock();
        state.requests.push(StoreRequest::CursorClose {
            proxy: id.clone(),
            cursor,
        });
        state.cursors.remove(&cursor);
        Ok(())
    }

    async fn get(&self, id: &ProxyId) -> std::result::Result<Option<T>, TransportError> {
        self.record(StoreRequest::Get { proxy: id.clone() });
        Ok(self.value(id))
    }

    async fn to_list(&self, id: &ProxyId) -> std::result::Result<Vec<T>, TransportError> {
        self.record(StoreRequest::ToList { proxy: id.clone() });
        Ok(self.list(id))
    }

    async fn stream_store(
        &self,
        id: &ProxyId,
        value: T,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> std::result::Result<(), TransportError> {
        self.apply_store(id, value, keys, originator)
    }

    async fn stream_remove(
        &self,
        id: &ProxyId,
        record_id: &str,
        originator: &ObserverId,
    ) -> std::result::Result<(), TransportError> {
        self.remove(id, record_id, Vec::new(), originator)
    }

    async fn stream(
        &self,
        id: &ProxyId,
        page_size: usize,
        forward: bool,
    ) -> std::result::Result<CursorId, TransportError> {
        if page_size == 0 {
            return Err(TransportError::Rejected("page size must be positive".to_string()));
        }
        let mut state = self.state.lock();
        state.requests.push(StoreRequest::Stream {
            proxy: id.clone(),
            page_size,
            forward,
        });
        let mut remaining: VecDeque<T> = state
            .objects
            .get(id)
            .map(|object| object.collection.to_list())
            .unwrap_or_default()
            .into();
        if !forward {
            remaining.make_contiguous().reverse();
        }

        let cursor = state.next_cursor;
        state.next_cursor += 1;
        state.cursors.insert(
            cursor,
            OpenCursor {
                proxy: id.clone(),
                remaining,
                page_size,
            },
        );
        Ok(cursor)
    }

    async fn cursor_next(
        &self,
        id: &ProxyId,
        cursor: CursorId,
    ) -> std::result::Result<CursorPage<T>, TransportError> {
        let mut state = self.state.lock();
        state.requests.push(StoreRequest::CursorNext {
            proxy: id.clone(),
            cursor,
        });
        let open = state
            .cursors
            .get_mut(&cursor)
            .filter(|open| open.proxy == *id)
            .ok_or(TransportError::UnknownCursor(cursor))?;

        let take = open.page_size.min(open.remaining.len());
        let value: Vec<T> = open.remaining.drain(..take).collect();
        let done = open.remaining.is_empty();
        if done {
            state.cursors.remove(&cursor);
        }
        Ok(CursorPage { value, done })
    }
}

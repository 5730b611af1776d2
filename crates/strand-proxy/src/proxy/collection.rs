//! Collection proxies.
//!
//! Collections merge through the observed-removed model: while fully
//! synchronized, writes apply to the local copy first and the echo the store
//! sends back for them is skipped by originator. Unsynchronized removals name
//! no keys, so the store removes whatever keys it holds when the request lands.

use super::{ProxyCore, ProxyKind, ProxyModel, SyncState, SyncedProxy};
use crate::error::{ProxyError, Result};
use crate::event::{ObserverId, UpdateBody, UpdateEvent};
use crate::observer::{Change, SyncModel};
use crate::transport::RemoveRequest;
use futures::future::{self, BoxFuture, FutureExt};
use strand_core::{CrdtCollection, CrdtError, MembershipKey, ModelEntry, Record};
use tracing::{debug, warn};

/// Local copy held by a collection proxy.
#[derive(Debug)]
pub struct CollectionState<T: Record> {
    model: CrdtCollection<T>,
}

impl<T: Record> CollectionState<T> {
    pub fn model(&self) -> &CrdtCollection<T> {
        &self.model
    }
}

impl<T: Record> Default for CollectionState<T> {
    fn default() -> Self {
        Self {
            model: CrdtCollection::new(),
        }
    }
}

pub type CollectionProxy<T> = SyncedProxy<T, CollectionState<T>>;

impl<T: Record> ProxyModel<T> for CollectionState<T> {
    const KIND: ProxyKind = ProxyKind::Collection;

    fn accepts(body: &UpdateBody<T>) -> bool {
        matches!(body, UpdateBody::Add(_) | UpdateBody::Remove(_))
    }

    fn sync_model(&self) -> SyncModel<T> {
        SyncModel::Collection(self.model.to_list())
    }

    fn synchronize(&mut self, model: Vec<ModelEntry<T>>) -> bool {
        self.model = CrdtCollection::from_literal(model);
        true
    }

    fn process_update(
        &mut self,
        core: &mut ProxyCore<T>,
        event: &UpdateEvent<T>,
        apply: bool,
    ) -> Option<Change<T>> {
        // Our own writes were applied and notified when they were made.
        if core.state == SyncState::Full {
            if let Some(originator) = &event.originator_id {
                if core.is_registered(originator) {
                    debug!(proxy = %core.id, %originator, version = event.version, "skipping echo");
                    return None;
                }
            }
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();
        match &event.body {
            UpdateBody::Add(items) => {
                for item in items {
                    let effective = if apply {
                        let id = item.value.id();
                        self.model
                            .add(id, item.value.clone(), &item.keys)
                            .unwrap_or_else(|error| {
                                warn!(proxy = %core.id, %error, "ignoring unmergeable add");
                                false
                            })
                    } else {
                        item.effective
                    };
                    if effective {
                        added.push(item.value.clone());
                    }
                }
            }
            UpdateBody::Remove(items) => {
                for item in items {
                    if !apply {
                        if item.effective {
                            removed.push(item.value.clone());
                        }
                        continue;
                    }
                    let id = item.value.id();
                    let local = self.model.get_value(id).cloned();
                    if self.model.remove(id, &item.keys) {
                        removed.extend(local);
                    }
                }
            }
            UpdateBody::Data { .. } => return None,
        }

        if added.is_empty() && removed.is_empty() {
            None
        } else {
            Some(Change::Collection { added, removed })
        }
    }
}

impl<T: Record> SyncedProxy<T, CollectionState<T>> {
    /// Add `value` under `keys`.
    pub fn store(
        &mut self,
        value: T,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> Result<()> {
        let synced = self.core.state == SyncState::Full;
        if synced {
            self.model.model.check_add(value.id(), &value, &keys)?;
        } else if keys.is_empty() {
            return Err(CrdtError::EmptyKeys {
                id: value.id().to_string(),
            }
            .into());
        }

        self.core
            .transport
            .store(&self.core.id, value.clone(), keys.clone(), originator)?;

        // Only what the store accepted reaches the local copy.
        let effective = synced && self.model.model.add(value.id(), value.clone(), &keys)?;
        if effective {
            self.core
                .notify_update(Change::added(vec![value]), Some(originator.clone()), |o| {
                    o.notify_update
                });
        }
        Ok(())
    }

    /// Remove `keys` of the value under `id`; empty `keys` means every key.
    pub fn remove(
        &mut self,
        id: &str,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> Result<()> {
        if self.core.state != SyncState::Full {
            self.core
                .transport
                .remove(&self.core.id, id, Vec::new(), originator)?;
            return Ok(());
        }

        let Some(value) = self.model.model.get_value(id).cloned() else {
            return Ok(());
        };
        let keys = if keys.is_empty() {
            self.model.model.get_keys(id)
        } else {
            keys
        };
        self.core
            .transport
            .remove(&self.core.id, id, keys.clone(), originator)?;

        if self.model.model.remove(id, &keys) {
            self.core
                .notify_update(Change::removed(vec![value]), Some(originator.clone()), |o| {
                    o.notify_update
                });
        }
        Ok(())
    }

    /// Remove every value.
    pub fn clear(&mut self, originator: &ObserverId) -> Result<()> {
        if self.core.state != SyncState::Full {
            self.core
                .transport
                .remove_multiple(&self.core.id, Vec::new(), originator)?;
            return Ok(());
        }

        let items: Vec<RemoveRequest> = self
            .model
            .model
            .iter()
            .map(|(id, entry)| RemoveRequest {
                id: id.to_string(),
                keys: entry.keys.iter().cloned().collect(),
            })
            .collect();
        if items.is_empty() {
            return Ok(());
        }
        self.core
            .transport
            .remove_multiple(&self.core.id, items.clone(), originator)?;

        let mut removed = Vec::new();
        for item in items {
            let value = self.model.model.get_value(&item.id).cloned();
            if self.model.model.remove(&item.id, &item.keys) {
                removed.extend(value);
            }
        }
        if !removed.is_empty() {
            self.core
                .notify_update(Change::removed(removed), Some(originator.clone()), |o| {
                    o.notify_update
                });
        }
        Ok(())
    }

    /// Current contents, read locally when fully synchronized.
    pub fn to_list(&self) -> BoxFuture<'static, Result<Vec<T>>> {
        if self.core.state == SyncState::Full {
            return future::ready(Ok(self.model.model.to_list())).boxed();
        }
        let transport = self.core.transport.clone();
        let id = self.core.id.clone();
        async move {
            let list = transport.to_list(&id).await?;
            Ok::<_, ProxyError>(list)
        }
        .boxed()
    }

    /// The value stored under `id`, read locally when fully synchronized.
    pub fn get(&self, id: &str) -> BoxFuture<'static, Result<Option<T>>> {
        if self.core.state == SyncState::Full {
            return future::ready(Ok(self.model.model.get_value(id).cloned())).boxed();
        }
        let transport = self.core.transport.clone();
        let proxy = self.core.id.clone();
        let id = id.to_string();
        async move {
            let list = transport.to_list(&proxy).await?;
            Ok::<_, ProxyError>(list.into_iter().find(|value| value.id() == id))
        }
        .boxed()
    }
}

//! Variable proxies: a single cell under last-writer-wins.
//!
//! A local write applies immediately and leaves a barrier token outstanding.
//! Until the store echoes that token back, incoming events describe writes
//! that lost to ours and are skipped, and full models are refused.

use super::{ProxyCore, ProxyKind, ProxyModel, SyncState, SyncedProxy};
use crate::error::{ProxyError, Result};
use crate::event::{Barrier, ObserverId, UpdateBody, UpdateEvent};
use crate::observer::{Change, Notification, SyncModel};
use futures::future::{self, BoxFuture, FutureExt};
use strand_core::{ModelEntry, Record};
use tracing::debug;

/// Local copy held by a variable proxy.
#[derive(Debug)]
pub struct VariableState<T: Record> {
    cell: Option<T>,
    barrier: Option<Barrier>,
}

impl<T: Record> VariableState<T> {
    pub fn value(&self) -> Option<&T> {
        self.cell.as_ref()
    }

    /// The token of the local write still awaiting its echo.
    pub fn barrier(&self) -> Option<&Barrier> {
        self.barrier.as_ref()
    }
}

impl<T: Record> Default for VariableState<T> {
    fn default() -> Self {
        Self {
            cell: None,
            barrier: None,
        }
    }
}

pub type VariableProxy<T> = SyncedProxy<T, VariableState<T>>;

impl<T: Record> ProxyModel<T> for VariableState<T> {
    const KIND: ProxyKind = ProxyKind::Variable;

    fn accepts(body: &UpdateBody<T>) -> bool {
        matches!(body, UpdateBody::Data { .. })
    }

    fn sync_model(&self) -> SyncModel<T> {
        SyncModel::Variable(self.cell.clone())
    }

    fn synchronize(&mut self, model: Vec<ModelEntry<T>>) -> bool {
        if self.barrier.is_some() {
            return false;
        }
        self.cell = model.into_iter().next().map(|entry| entry.value);
        true
    }

    fn process_update(
        &mut self,
        core: &mut ProxyCore<T>,
        event: &UpdateEvent<T>,
        apply: bool,
    ) -> Option<Change<T>> {
        let UpdateBody::Data { data, barrier } = &event.body else {
            return None;
        };
        if !apply {
            return Some(Change::Variable { data: data.clone() });
        }

        let Some(outstanding) = &self.barrier else {
            self.cell = data.clone();
            return Some(Change::Variable { data: data.clone() });
        };

        if barrier.as_ref() != Some(outstanding) {
            debug!(proxy = %core.id, version = event.version, "skipping write that lost to ours");
            return None;
        }
        self.barrier = None;
        if core.state != SyncState::Full {
            core.state = SyncState::Full;
            core.notify(Notification::Sync(self.sync_model()), |o| {
                o.keep_synced && o.notify_sync
            });
        }
        None
    }

    fn is_barrier_ack(&self, event: &UpdateEvent<T>) -> bool {
        self.barrier.is_some() && event.barrier() == self.barrier.as_ref()
    }
}

impl<T: Record> SyncedProxy<T, VariableState<T>> {
    /// Replace the cell with `value`.
    pub fn set(&mut self, value: T, originator: &ObserverId) -> Result<()> {
        if self.model.cell.as_ref() == Some(&value) {
            return Ok(());
        }
        self.write(Some(value), originator)
    }

    /// Empty the cell.
    pub fn clear(&mut self, originator: &ObserverId) -> Result<()> {
        if self.core.state == SyncState::Full && self.model.cell.is_none() {
            return Ok(());
        }
        self.write(None, originator)
    }

    /// Current value, read locally when fully synchronized.
    pub fn fetch(&self) -> BoxFuture<'static, Result<Option<T>>> {
        if self.core.state == SyncState::Full {
            return future::ready(Ok(self.model.cell.clone())).boxed();
        }
        let transport = self.core.transport.clone();
        let id = self.core.id.clone();
        async move {
            let value = transport.get(&id).await?;
            Ok::<_, ProxyError>(value)
        }
        .boxed()
    }

    fn write(&mut self, value: Option<T>, originator: &ObserverId) -> Result<()> {
        // Without a listener the echo would never reach us.
        let barrier = self
            .core
            .listener_attached
            .then(|| Barrier::generate(&self.core.id));

        match &value {
            Some(value) => self.core.transport.set(
                &self.core.id,
                value.clone(),
                originator,
                barrier.clone(),
            )?,
            None => self
                .core
                .transport
                .clear(&self.core.id, originator, barrier.clone())?,
        }

        self.model.cell = value.clone();
        self.model.barrier = barrier;
        self.core.notify_update(
            Change::Variable { data: value },
            Some(originator.clone()),
            |o| o.notify_update,
        );
        Ok(())
    }
}

//! Streaming proxies for collections too large to mirror.
//!
//! Nothing is held locally. Writes go straight to the store and reads page
//! through a snapshot cursor.

use super::Registration;
use crate::error::{ProxyError, Result};
use crate::event::{ObserverId, ProxyId};
use crate::observer::{Notification, Observer, ObserverOptions, SyncModel};
use crate::scheduler::NotificationScheduler;
use crate::transport::{CursorId, CursorPage, Transport};
use futures::future::{self, BoxFuture, FutureExt};
use futures::Stream;
use std::sync::Arc;
use strand_core::{MembershipKey, Record};

pub struct StreamingProxy<T: Record> {
    id: ProxyId,
    transport: Arc<dyn Transport<T>>,
    scheduler: NotificationScheduler<T>,
    registrations: Vec<Registration<T>>,
}

impl<T: Record> StreamingProxy<T> {
    pub fn new(
        id: ProxyId,
        transport: Arc<dyn Transport<T>>,
        scheduler: NotificationScheduler<T>,
    ) -> Self {
        Self {
            id,
            transport,
            scheduler,
            registrations: Vec::new(),
        }
    }

    pub fn id(&self) -> &ProxyId {
        &self.id
    }

    /// Registering always yields an immediate, empty sync.
    pub fn register(&mut self, observer: Arc<dyn Observer<T>>) -> Result<()> {
        if self
            .registrations
            .iter()
            .any(|r| r.observer.id() == observer.id())
        {
            return Err(ProxyError::AlreadyRegistered {
                proxy: self.id.clone(),
                observer: observer.id().clone(),
            });
        }
        self.scheduler.enqueue(
            &observer,
            &self.id,
            Notification::Sync(SyncModel::Unsynchronized),
        );
        self.registrations.push(Registration {
            observer,
            options: ObserverOptions {
                keep_synced: false,
                notify_sync: true,
                notify_update: false,
                notify_desync: false,
            },
        });
        Ok(())
    }

    pub fn deregister(&mut self, observer: &ObserverId) -> bool {
        self.registrations.retain(|r| r.observer.id() != observer);
        !self.registrations.is_empty()
    }

    /// Resolves once the store has accepted the write.
    pub fn store(
        &self,
        value: T,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> BoxFuture<'static, Result<()>> {
        let transport = self.transport.clone();
        let id = self.id.clone();
        let originator = originator.clone();
        async move {
            transport.stream_store(&id, value, keys, &originator).await?;
            Ok::<_, ProxyError>(())
        }
        .boxed()
    }

    /// Resolves once the store has removed every key of `record_id`.
    pub fn remove(&self, record_id: &str, originator: &ObserverId) -> BoxFuture<'static, Result<()>> {
        let transport = self.transport.clone();
        let id = self.id.clone();
        let record_id = record_id.to_string();
        let originator = originator.clone();
        async move {
            transport.stream_remove(&id, &record_id, &originator).await?;
            Ok::<_, ProxyError>(())
        }
        .boxed()
    }

    /// Open a cursor over a snapshot of the collection, newest first unless
    /// `forward`.
    pub fn stream(&self, page_size: usize, forward: bool) -> BoxFuture<'static, Result<Cursor<T>>> {
        if page_size == 0 {
            return future::ready(Err(ProxyError::InvalidPageSize)).boxed();
        }
        let transport = self.transport.clone();
        let id = self.id.clone();
        async move {
            let cursor = transport.stream(&id, page_size, forward).await?;
            Ok::<_, ProxyError>(Cursor {
                proxy: id,
                id: cursor,
                transport,
                done: false,
            })
        }
        .boxed()
    }
}

/// A paginated read over a snapshot of a streaming collection.
pub struct Cursor<T: Record> {
    proxy: ProxyId,
    id: CursorId,
    transport: Arc<dyn Transport<T>>,
    done: bool,
}

impl<T: Record> Cursor<T> {
    pub fn id(&self) -> CursorId {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Read the next page. After the last page this keeps returning an empty,
    /// finished page without asking the store.
    pub async fn next(&mut self) -> Result<CursorPage<T>> {
        if self.done {
            return Ok(CursorPage {
                value: Vec::new(),
                done: true,
            });
        }
        let page = self.transport.cursor_next(&self.proxy, self.id).await?;
        self.done = page.done;
        Ok(page)
    }

    /// Release the cursor at the store.
    pub fn close(self) -> Result<()> {
        self.transport.cursor_close(&self.proxy, self.id)?;
        Ok(())
    }

    /// The remaining pages as a stream. The cursor is closed once exhausted.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Vec<T>>> {
        async_stream::try_stream! {
            loop {
                let page = self.next().await?;
                if !page.value.is_empty() {
                    yield page.value;
                }
                if page.done {
                    break;
                }
            }
            self.close()?;
        }
    }
}

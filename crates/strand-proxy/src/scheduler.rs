//! Notification scheduling.
//!
//! Proxies never call observers directly. They enqueue notifications here,
//! keyed by observer and then by proxy, and a flush deferred through a
//! [`Spawner`] delivers them later with no proxy state borrowed. Within one
//! (observer, proxy) pair notifications arrive in the order they were queued.

use crate::event::{ObserverId, ProxyId};
use crate::observer::{
    FaultReporter, Notification, Observer, ObserverUpdate, TracingFaultReporter,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use strand_core::Record;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs deferred flushes on a later turn.
pub trait Spawner: Send + Sync {
    fn defer(&self, task: Task);
}

/// Defers onto a tokio runtime, after yielding once.
#[derive(Clone, Debug)]
pub struct TokioSpawner {
    handle: Handle,
}

impl TokioSpawner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Spawner for the runtime this is called from.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Spawner for TokioSpawner {
    fn defer(&self, task: Task) {
        self.handle.spawn(async move {
            tokio::task::yield_now().await;
            task();
        });
    }
}

/// Collects deferred tasks until the caller runs them.
#[derive(Clone, Default)]
pub struct ManualSpawner {
    tasks: Arc<Mutex<Vec<Task>>>,
}

impl ManualSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run deferred tasks, including any they defer, until none remain.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch = std::mem::take(&mut *self.tasks.lock());
            if batch.is_empty() {
                return ran;
            }
            for task in batch {
                task();
                ran += 1;
            }
        }
    }
}

impl Spawner for ManualSpawner {
    fn defer(&self, task: Task) {
        self.tasks.lock().push(task);
    }
}

struct Queued<T: Record> {
    observer: Arc<dyn Observer<T>>,
    by_proxy: IndexMap<ProxyId, VecDeque<Notification<T>>>,
}

struct State<T: Record> {
    queues: IndexMap<ObserverId, Queued<T>>,
    /// Queued plus in-delivery notifications.
    pending: usize,
    scheduled: bool,
}

struct Inner<T: Record> {
    state: Mutex<State<T>>,
    flushing: Mutex<()>,
    busy_tx: watch::Sender<bool>,
    spawner: Arc<dyn Spawner>,
    reporter: Arc<dyn FaultReporter>,
}

/// Batches and serializes observer notifications.
pub struct NotificationScheduler<T: Record> {
    inner: Arc<Inner<T>>,
}

impl<T: Record> Clone for NotificationScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Record> NotificationScheduler<T> {
    pub fn new(spawner: Arc<dyn Spawner>, reporter: Arc<dyn FaultReporter>) -> Self {
        let (busy_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queues: IndexMap::new(),
                    pending: 0,
                    scheduled: false,
                }),
                flushing: Mutex::new(()),
                busy_tx,
                spawner,
                reporter,
            }),
        }
    }

    /// Scheduler that reports faults through `tracing`.
    pub fn with_spawner(spawner: Arc<dyn Spawner>) -> Self {
        Self::new(spawner, Arc::new(TracingFaultReporter))
    }

    /// Scheduler flushing on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn tokio() -> Self {
        Self::with_spawner(Arc::new(TokioSpawner::current()))
    }

    /// Queue `notification` for `observer` about `proxy` and make sure a flush
    /// is scheduled.
    pub fn enqueue(
        &self,
        observer: &Arc<dyn Observer<T>>,
        proxy: &ProxyId,
        notification: Notification<T>,
    ) {
        let schedule = {
            let mut state = self.inner.state.lock();
            state
                .queues
                .entry(observer.id().clone())
                .or_insert_with(|| Queued {
                    observer: observer.clone(),
                    by_proxy: IndexMap::new(),
                })
                .by_proxy
                .entry(proxy.clone())
                .or_default()
                .push_back(notification);

            state.pending += 1;
            if state.pending == 1 {
                self.inner.busy_tx.send_replace(true);
            }
            !std::mem::replace(&mut state.scheduled, true)
        };

        if schedule {
            let scheduler = self.clone();
            self.inner.spawner.defer(Box::new(move || scheduler.flush()));
        }
    }

    /// Deliver everything queued, one observer at a time.
    ///
    /// Reentrant calls (from inside a callback) and calls racing an active
    /// flush return immediately; the active flush picks up their work.
    pub fn flush(&self) {
        loop {
            {
                let Some(_guard) = self.inner.flushing.try_lock() else {
                    return;
                };
                while let Some((_, queued)) = self.next_observer() {
                    for (proxy, notifications) in queued.by_proxy {
                        for notification in notifications {
                            self.dispatch(&queued.observer, &proxy, notification);
                            self.delivered();
                        }
                    }
                }
            }

            let mut state = self.inner.state.lock();
            if state.queues.is_empty() {
                state.scheduled = false;
                return;
            }
        }
    }

    /// True while any notification is queued or being delivered.
    pub fn busy(&self) -> bool {
        *self.inner.busy_tx.borrow()
    }

    /// Resolves once nothing is queued or being delivered.
    pub fn idle(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut busy = self.inner.busy_tx.subscribe();
        async move {
            // The sender lives as long as the scheduler; a closed channel
            // means nothing can be queued any more.
            let _ = busy.wait_for(|busy| !*busy).await;
        }
    }

    fn next_observer(&self) -> Option<(ObserverId, Queued<T>)> {
        self.inner.state.lock().queues.shift_remove_index(0)
    }

    fn delivered(&self) {
        let mut state = self.inner.state.lock();
        state.pending -= 1;
        if state.pending == 0 {
            self.inner.busy_tx.send_replace(false);
        }
    }

    fn dispatch(
        &self,
        observer: &Arc<dyn Observer<T>>,
        proxy: &ProxyId,
        notification: Notification<T>,
    ) {
        let method_name = notification.method_name();
        let outcome = catch_unwind(AssertUnwindSafe(|| match notification {
            Notification::Sync(model) => observer.on_sync(proxy, model),
            Notification::Update {
                change,
                originator_id,
            } => {
                let originator = originator_id.as_ref() == Some(observer.id());
                observer.on_update(proxy, ObserverUpdate { change, originator })
            }
            Notification::Desync => observer.on_desync(proxy),
        }));

        let result = outcome.unwrap_or_else(|panic| Err(panic_message(panic).into()));
        if let Err(error) = result {
            self.inner
                .reporter
                .raise_fault(&error, method_name, observer.id());
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("observer panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("observer panicked: {}", message)
    } else {
        "observer panicked".to_string()
    }
}

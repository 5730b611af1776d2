//! Observer callbacks, registration options and fault reporting.

use crate::error::ObserverError;
use crate::event::{ObserverId, ProxyId};
use strand_core::Record;

/// How an observer wants to follow a proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserverOptions {
    /// Maintain a full local mirror of the remote object.
    pub keep_synced: bool,
    /// Deliver `on_sync` once the mirror is complete.
    pub notify_sync: bool,
    /// Deliver `on_update` for every change.
    pub notify_update: bool,
    /// Deliver `on_desync` when the mirror falls behind.
    pub notify_desync: bool,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            keep_synced: true,
            notify_sync: true,
            notify_update: true,
            notify_desync: false,
        }
    }
}

/// Builder for observer options.
pub struct ObserverOptionsBuilder {
    options: ObserverOptions,
}

impl ObserverOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: ObserverOptions::default(),
        }
    }

    pub fn keep_synced(mut self, enabled: bool) -> Self {
        self.options.keep_synced = enabled;
        self
    }

    pub fn notify_sync(mut self, enabled: bool) -> Self {
        self.options.notify_sync = enabled;
        self
    }

    pub fn notify_update(mut self, enabled: bool) -> Self {
        self.options.notify_update = enabled;
        self
    }

    pub fn notify_desync(mut self, enabled: bool) -> Self {
        self.options.notify_desync = enabled;
        self
    }

    pub fn build(self) -> ObserverOptions {
        self.options
    }
}

impl Default for ObserverOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The model handed to `on_sync`.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncModel<T> {
    Collection(Vec<T>),
    Variable(Option<T>),
    /// Streaming proxies hold nothing to synchronize.
    Unsynchronized,
}

/// What changed in an update.
#[derive(Clone, Debug, PartialEq)]
pub enum Change<T> {
    Collection { added: Vec<T>, removed: Vec<T> },
    Variable { data: Option<T> },
}

impl<T> Change<T> {
    pub fn added(values: Vec<T>) -> Self {
        Change::Collection {
            added: values,
            removed: Vec::new(),
        }
    }

    pub fn removed(values: Vec<T>) -> Self {
        Change::Collection {
            added: Vec::new(),
            removed: values,
        }
    }
}

/// The update handed to `on_update`.
#[derive(Clone, Debug, PartialEq)]
pub struct ObserverUpdate<T> {
    pub change: Change<T>,
    /// True iff this observer's own write caused the change.
    pub originator: bool,
}

/// A queued notification.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification<T> {
    Sync(SyncModel<T>),
    Update {
        change: Change<T>,
        originator_id: Option<ObserverId>,
    },
    Desync,
}

impl<T> Notification<T> {
    /// Name of the callback this notification is delivered to.
    pub fn method_name(&self) -> &'static str {
        match self {
            Notification::Sync(_) => "on_sync",
            Notification::Update { .. } => "on_update",
            Notification::Desync => "on_desync",
        }
    }
}

pub type ObserverResult = Result<(), ObserverError>;

/// A consumer of proxy notifications.
///
/// Callbacks run on the scheduler's flush, never while a proxy is being
/// mutated. An `Err` (or a panic) is reported to the [`FaultReporter`] and does
/// not stop delivery to other observers.
pub trait Observer<T: Record>: Send + Sync {
    fn id(&self) -> &ObserverId;

    fn on_sync(&self, _proxy: &ProxyId, _model: SyncModel<T>) -> ObserverResult {
        Ok(())
    }

    fn on_update(&self, _proxy: &ProxyId, _update: ObserverUpdate<T>) -> ObserverResult {
        Ok(())
    }

    fn on_desync(&self, _proxy: &ProxyId) -> ObserverResult {
        Ok(())
    }
}

/// Host hook for faults raised inside observer callbacks.
pub trait FaultReporter: Send + Sync {
    fn raise_fault(&self, error: &ObserverError, method_name: &str, observer: &ObserverId);
}

/// Reports faults through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingFaultReporter;

impl FaultReporter for TracingFaultReporter {
    fn raise_fault(&self, error: &ObserverError, method_name: &str, observer: &ObserverId) {
        tracing::error!(%observer, method = method_name, %error, "observer callback failed");
    }
}

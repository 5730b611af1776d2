//! Identifiers and the messages exchanged with the backing store.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use strand_core::{MembershipKey, ModelEntry, Record};
use tokio::sync::mpsc;
use ulid::Ulid;

/// Names one remote object. Stable for the object's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyId(pub String);

impl ProxyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProxyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProxyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ProxyId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Names one observer. Doubles as the originator id on writes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub String);

impl ObserverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObserverId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Number of update events causally applied to a proxy.
pub type Version = u64;

/// Correlation token for an in-flight variable write.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Barrier(pub String);

impl Barrier {
    pub fn generate(proxy_id: &ProxyId) -> Self {
        Self(format!("{}:barrier:{}", proxy_id, Ulid::new()))
    }

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

/// One value in a collection event, with the keys it was added or removed under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelItem<T> {
    pub value: T,
    pub keys: Vec<MembershipKey>,
    /// Whether the operation changed observable state at the store.
    #[serde(default)]
    pub effective: bool,
}

impl<T> ModelItem<T> {
    pub fn new(value: T, keys: Vec<MembershipKey>, effective: bool) -> Self {
        Self {
            value,
            keys,
            effective,
        }
    }
}

/// Payload of an update event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UpdateBody<T> {
    Add(Vec<ModelItem<T>>),
    Remove(Vec<ModelItem<T>>),
    Data {
        data: Option<T>,
        barrier: Option<Barrier>,
    },
}

/// A change pushed by the backing store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent<T> {
    pub version: Version,
    pub originator_id: Option<ObserverId>,
    pub body: UpdateBody<T>,
}

impl<T> UpdateEvent<T> {
    pub fn add(version: Version, items: Vec<ModelItem<T>>) -> Self {
        Self {
            version,
            originator_id: None,
            body: UpdateBody::Add(items),
        }
    }

    pub fn remove(version: Version, items: Vec<ModelItem<T>>) -> Self {
        Self {
            version,
            originator_id: None,
            body: UpdateBody::Remove(items),
        }
    }

    pub fn data(version: Version, data: Option<T>, barrier: Option<Barrier>) -> Self {
        Self {
            version,
            originator_id: None,
            body: UpdateBody::Data { data, barrier },
        }
    }

    pub fn with_originator(mut self, originator: Option<ObserverId>) -> Self {
        self.originator_id = originator;
        self
    }

    pub fn barrier(&self) -> Option<&Barrier> {
        match &self.body {
            UpdateBody::Data { barrier, .. } => barrier.as_ref(),
            _ => None,
        }
    }
}

/// Full-model response to a synchronize request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse<T> {
    pub version: Version,
    pub model: Vec<ModelEntry<T>>,
}

/// Anything the store sends back to a proxy.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteMessage<T> {
    Update(UpdateEvent<T>),
    Synchronized(SyncResponse<T>),
}

/// A remote message addressed to one proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct Inbound<T> {
    pub proxy_id: ProxyId,
    pub message: RemoteMessage<T>,
}

/// Callback handed to the transport for one proxy.
///
/// Everything sent through it lands in the engine inbox and is applied on the
/// next [`pump`](crate::engine::StorageEngine::pump).
#[derive(Clone, Debug)]
pub struct ProxyListener<T> {
    proxy_id: ProxyId,
    tx: mpsc::UnboundedSender<Inbound<T>>,
}

impl<T: Record> ProxyListener<T> {
    pub fn new(proxy_id: ProxyId, tx: mpsc::UnboundedSender<Inbound<T>>) -> Self {
        Self { proxy_id, tx }
    }

    pub fn proxy_id(&self) -> &ProxyId {
        &self.proxy_id
    }

    /// Whether both listeners feed the same proxy through the same inbox.
    pub fn same_target(&self, other: &ProxyListener<T>) -> bool {
        self.proxy_id == other.proxy_id && self.tx.same_channel(&other.tx)
    }

    pub fn update(&self, event: UpdateEvent<T>) -> Result<(), TransportError> {
        self.send(RemoteMessage::Update(event))
    }

    pub fn synchronized(&self, response: SyncResponse<T>) -> Result<(), TransportError> {
        self.send(RemoteMessage::Synchronized(response))
    }

    fn send(&self, message: RemoteMessage<T>) -> Result<(), TransportError> {
        self.tx
            .send(Inbound {
                proxy_id: self.proxy_id.clone(),
                message,
            })
            .map_err(|_| TransportError::Disconnected)
    }
}

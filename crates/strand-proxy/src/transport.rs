//! The boundary to the authoritative backing store.

use crate::error::TransportError;
use crate::event::{Barrier, ObserverId, ProxyId, ProxyListener};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strand_core::{MembershipKey, Record};

/// Handle for an open cursor at the store.
pub type CursorId = u64;

/// One page read from a cursor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CursorPage<T> {
    pub value: Vec<T>,
    pub done: bool,
}

/// One entry of a batched remove. Empty `keys` means every key the store holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub id: String,
    pub keys: Vec<MembershipKey>,
}

/// Requests a proxy can make of the store.
///
/// Methods without a result are fire-and-forget: their `Err` only reports a
/// failure to send, and the store answers (if at all) through the proxy's
/// [`ProxyListener`].
#[async_trait]
pub trait Transport<T: Record>: Send + Sync + 'static {
    /// Start delivering update events for `id` to `listener`.
    fn initialize_proxy(&self, id: &ProxyId, listener: ProxyListener<T>)
        -> Result<(), TransportError>;

    /// Stop delivering to `listener`, including answers to full-model
    /// requests it has not received yet. Unknown listeners are ignored.
    fn detach_proxy(&self, id: &ProxyId, listener: &ProxyListener<T>)
        -> Result<(), TransportError>;

    /// Ask for the full model of `id`; the answer arrives at `listener`.
    fn synchronize_proxy(
        &self,
        id: &ProxyId,
        listener: ProxyListener<T>,
    ) -> Result<(), TransportError>;

    fn store(
        &self,
        id: &ProxyId,
        value: T,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> Result<(), TransportError>;

    /// Remove `keys` for `record_id`; empty `keys` removes every key.
    fn remove(
        &self,
        id: &ProxyId,
        record_id: &str,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> Result<(), TransportError>;

    /// Batched remove; an empty batch clears the collection.
    fn remove_multiple(
        &self,
        id: &ProxyId,
        items: Vec<RemoveRequest>,
        originator: &ObserverId,
    ) -> Result<(), TransportError>;

    fn set(
        &self,
        id: &ProxyId,
        value: T,
        originator: &ObserverId,
        barrier: Option<Barrier>,
    ) -> Result<(), TransportError>;

    fn clear(
        &self,
        id: &ProxyId,
        originator: &ObserverId,
        barrier: Option<Barrier>,
    ) -> Result<(), TransportError>;

    fn cursor_close(&self, id: &ProxyId, cursor: CursorId) -> Result<(), TransportError>;

    /// Current value of a variable.
    async fn get(&self, id: &ProxyId) -> Result<Option<T>, TransportError>;

    /// Current contents of a collection.
    async fn to_list(&self, id: &ProxyId) -> Result<Vec<T>, TransportError>;

    async fn stream_store(
        &self,
        id: &ProxyId,
        value: T,
        keys: Vec<MembershipKey>,
        originator: &ObserverId,
    ) -> Result<(), TransportError>;

    async fn stream_remove(
        &self,
        id: &ProxyId,
        record_id: &str,
        originator: &ObserverId,
    ) -> Result<(), TransportError>;

    /// Open a snapshot cursor over a collection.
    async fn stream(
        &self,
        id: &ProxyId,
        page_size: usize,
        forward: bool,
    ) -> Result<CursorId, TransportError>;

    async fn cursor_next(
        &self,
        id: &ProxyId,
        cursor: CursorId,
    ) -> Result<CursorPage<T>, TransportError>;
}

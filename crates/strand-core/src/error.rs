//! Error types for the collection model.

use thiserror::Error;

/// Precondition violations raised by [`CrdtCollection`](crate::CrdtCollection).
///
/// These indicate a caller bug (a merge without provenance), not a runtime
/// condition the engine can recover from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    #[error("add of '{id}' requires at least one membership key")]
    EmptyKeys { id: String },

    #[error("cannot change the value of '{id}' without new membership keys")]
    MissingNewKeys { id: String },
}

pub type Result<T> = std::result::Result<T, CrdtError>;

// File: `crates/strand-core/src/lib.rs`
//! Core data types for the Strand storage synchronization engine.
//!
//! - [`collection`] - the observed-removed collection model used by set-valued proxies
//! - [`record`] - the [`Record`] trait and the JSON-backed [`Entity`]
//! - [`error`] - precondition errors raised by the model

pub mod collection;
pub mod error;
pub mod record;

pub use collection::{fresh_key, CrdtCollection, CrdtEntry, MembershipKey, ModelEntry};
pub use error::{CrdtError, Result};
pub use record::{Entity, Record};

//! Durable-store contract and the version-guarded mutation helpers.
//!
//! The engine treats persistence as an external collaborator reachable
//! through [`Collection`]: create, get-by-id, conditional-update (fails on
//! version mismatch), delete, and query-by-filter. Every record carries a
//! version token; a writer that loses a conditional update must re-read and
//! decide again — there is no silent overwrite.
//!
//! [`InMemoryCollection`] is the reference implementation used by tests and
//! embeddings; a real deployment plugs a document store in behind the same
//! trait. [`EngineStore`] bundles the engine's collections and layers the
//! domain guards (status transition table, idempotent interrupt effects,
//! children bookkeeping) on top of the raw contract.

pub mod engine_store;
pub mod memory;

pub use engine_store::{EffectOutcome, EngineStore};
pub use memory::InMemoryCollection;

use miette::Diagnostic;
use thiserror::Error;

use crate::status::Status;

/// Anything storable: identified by a stable string id.
pub trait Record {
    fn id(&self) -> &str;
}

/// A document plus its optimistic-concurrency version token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub doc: T,
}

/// Storage faults. `StaleState` is always retryable by re-reading;
/// `IllegalTransition` is a programming or configuration bug and is
/// surfaced, never retried.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("record not found: {id}")]
    #[diagnostic(code(planwright::store::not_found))]
    NotFound { id: String },

    #[error("record already exists: {id}")]
    #[diagnostic(code(planwright::store::already_exists))]
    AlreadyExists { id: String },

    #[error("stale state on {id}: {detail}")]
    #[diagnostic(
        code(planwright::store::stale_state),
        help("Another writer won the race; re-read the record and decide again.")
    )]
    StaleState { id: String, detail: String },

    #[error("illegal transition on {id}: {from} -> {to}")]
    #[diagnostic(
        code(planwright::store::illegal_transition),
        help("The record is positively finalized; mutating it is a bug, not a race.")
    )]
    IllegalTransition { id: String, from: Status, to: Status },

    #[error("contention on {id}: conditional update lost {attempts} races")]
    #[diagnostic(code(planwright::store::contention))]
    Contention { id: String, attempts: u32 },
}

impl StoreError {
    pub(crate) fn stale(id: impl Into<String>, detail: impl Into<String>) -> Self {
        StoreError::StaleState {
            id: id.into(),
            detail: detail.into(),
        }
    }
}

/// CRUD + atomic conditional-update contract over one record type.
pub trait Collection<T: Record + Clone>: Send + Sync {
    /// Insert a new document at version 1. Fails if the id exists.
    fn create(&self, doc: T) -> Result<Versioned<T>, StoreError>;

    fn get(&self, id: &str) -> Result<Versioned<T>, StoreError>;

    /// Replace the document iff the stored version equals `expected_version`.
    fn conditional_update(
        &self,
        expected_version: u64,
        doc: T,
    ) -> Result<Versioned<T>, StoreError>;

    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Snapshot of every document matching `filter`.
    fn find(&self, filter: &dyn Fn(&T) -> bool) -> Vec<Versioned<T>>;
}

/// Bounded read-modify-CAS loop over a collection, with short jittered
/// backoff between lost races. `mutate` may reject the observed document by
/// returning an error, which aborts the loop immediately.
pub fn mutate_with_retry<T, F>(
    collection: &dyn Collection<T>,
    id: &str,
    attempts: u32,
    mutate: F,
) -> Result<Versioned<T>, StoreError>
where
    T: Record + Clone,
    F: Fn(&mut T) -> Result<(), StoreError>,
{
    for attempt in 0..attempts {
        let current = collection.get(id)?;
        let mut doc = current.doc.clone();
        mutate(&mut doc)?;
        match collection.conditional_update(current.version, doc) {
            Ok(updated) => return Ok(updated),
            Err(StoreError::StaleState { .. }) => {
                std::thread::sleep(crate::utils::backoff::jittered(attempt));
            }
            Err(other) => return Err(other),
        }
    }
    Err(StoreError::Contention {
        id: id.to_string(),
        attempts,
    })
}

/// Like [`mutate_with_retry`], but the closure also produces a value
/// describing what the winning update did (acquired vs. queued, flipped vs.
/// already flipped). The value from the attempt that won the race is
/// returned alongside the updated document.
pub fn mutate_returning<T, R, F>(
    collection: &dyn Collection<T>,
    id: &str,
    attempts: u32,
    mutate: F,
) -> Result<(Versioned<T>, R), StoreError>
where
    T: Record + Clone,
    F: Fn(&mut T) -> Result<R, StoreError>,
{
    for attempt in 0..attempts {
        let current = collection.get(id)?;
        let mut doc = current.doc.clone();
        let outcome = mutate(&mut doc)?;
        match collection.conditional_update(current.version, doc) {
            Ok(updated) => return Ok((updated, outcome)),
            Err(StoreError::StaleState { .. }) => {
                std::thread::sleep(crate::utils::backoff::jittered(attempt));
            }
            Err(other) => return Err(other),
        }
    }
    Err(StoreError::Contention {
        id: id.to_string(),
        attempts,
    })
}

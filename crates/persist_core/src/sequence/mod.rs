//! Identifier sequences: store contract, block allocator and stores.
//!
//! # Responsibility
//! - Define the `SequenceStore` collaborator contract.
//! - Serve identifiers from pre-fetched blocks (hi-lo allocation).
//!
//! # Invariants
//! - No identifier is issued twice by one allocator.
//! - Cross-process uniqueness relies on `SequenceStore::fetch_next_block`
//!   being atomic in the backing store.

use crate::model::sequence::SequenceRow;
use crate::repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod allocator;
pub mod memory;
pub mod sqlite;

pub use allocator::SequenceAllocator;
pub use memory::MemorySequenceStore;
pub use sqlite::SqliteSequenceStore;

pub type SequenceResult<T> = Result<T, SequenceError>;

#[derive(Debug)]
pub enum SequenceError {
    /// `allocate` was asked for zero identifiers.
    InvalidCount(usize),
    InvalidName(String),
    UnregisteredSequence(String),
    /// No counter row exists for the sequence.
    NotFound(String),
    /// Optimistic counter update kept losing races.
    Conflict { name: String, attempts: u32 },
    /// The store returned a high-water mark below the sequence minimum.
    EmptyBlock { name: String, high_water_mark: u64 },
    Store(String),
    Repo(RepoError),
}

impl Display for SequenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCount(count) => write!(f, "allocation count must be >= 1, got {count}"),
            Self::InvalidName(name) => write!(f, "invalid sequence name `{name}`"),
            Self::UnregisteredSequence(name) => write!(f, "sequence not registered: {name}"),
            Self::NotFound(name) => write!(f, "sequence row not found: {name}"),
            Self::Conflict { name, attempts } => write!(
                f,
                "sequence `{name}` update conflicted {attempts} times"
            ),
            Self::EmptyBlock {
                name,
                high_water_mark,
            } => write!(
                f,
                "sequence `{name}` returned empty block at high-water mark {high_water_mark}"
            ),
            Self::Store(message) => write!(f, "sequence store failure: {message}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SequenceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for SequenceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Persisted counters keyed by name.
pub trait SequenceStore: Send + Sync {
    /// Creates the counter row unless it exists; returns the stored row.
    fn create_if_missing(
        &self,
        name: &str,
        increment: u64,
        min_value: u64,
    ) -> SequenceResult<SequenceRow>;

    /// Atomically advances the counter and returns the new high-water mark.
    fn fetch_next_block(&self, name: &str) -> SequenceResult<u64>;
}

impl<S: SequenceStore + ?Sized> SequenceStore for std::sync::Arc<S> {
    fn create_if_missing(
        &self,
        name: &str,
        increment: u64,
        min_value: u64,
    ) -> SequenceResult<SequenceRow> {
        (**self).create_if_missing(name, increment, min_value)
    }

    fn fetch_next_block(&self, name: &str) -> SequenceResult<u64> {
        (**self).fetch_next_block(name)
    }
}

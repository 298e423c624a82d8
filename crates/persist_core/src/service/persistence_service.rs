//! Persistence orchestrator.
//!
//! # Responsibility
//! - Compose `SequenceAllocator` and `RepositorySession` into id-assigning
//!   insert, state-driven save and upsert.
//! - Give every mutating call its own session and transaction.
//!
//! # Invariants
//! - Identifiers are allocated before a transaction opens; a failed call
//!   resets the ids it assigned and never changes entity state.
//! - A batch either commits as a whole or leaves the store untouched
//!   (`batch_insert` commits per chunk).
//! - Empty batches are a no-op and open no session.

use crate::model::entity::EntityState;
use crate::model::record::{Entity, Record, RecordSchema};
use crate::model::value::{FieldValue, IdValue};
use crate::repo::{
    ExecResult, Filter, FindQuery, GetQuery, RawRow, RepoError, RepoResult, RepositorySession,
    SessionFactory,
};
use crate::sequence::{SequenceAllocator, SequenceError, SequenceStore};
use log::{error, info};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

/// Records written per transaction by `batch_insert`.
pub const BATCH_INSERT_CHUNK: usize = 1000;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Caller-facing failure classes.
#[derive(Debug)]
pub enum ServiceError {
    /// Rejected before any I/O.
    Validation(String),
    NotFound(String),
    /// Optimistic counter update kept losing races.
    Conflict(String),
    /// Wrapped failure from the backing store.
    Store(Box<dyn Error + Send + Sync + 'static>),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "validation error: {message}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Conflict(message) => write!(f, "conflict: {message}"),
            Self::Store(err) => write!(f, "store error: {err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Validation(message) => Self::Validation(message),
            RepoError::NestedTransaction => Self::Validation(value.to_string()),
            RepoError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(Box::new(other)),
        }
    }
}

impl From<SequenceError> for ServiceError {
    fn from(value: SequenceError) -> Self {
        match value {
            SequenceError::InvalidCount(_)
            | SequenceError::InvalidName(_)
            | SequenceError::UnregisteredSequence(_) => Self::Validation(value.to_string()),
            SequenceError::NotFound(name) => Self::NotFound(format!("sequence `{name}`")),
            SequenceError::Conflict { .. } => Self::Conflict(value.to_string()),
            SequenceError::Repo(err) => Self::from(err),
            other => Self::Store(Box::new(other)),
        }
    }
}

/// Transactional persistence entry points over one backend.
pub struct PersistenceService<F: SessionFactory, S: SequenceStore> {
    sessions: F,
    allocator: Arc<SequenceAllocator<S>>,
}

impl<F: SessionFactory, S: SequenceStore> PersistenceService<F, S> {
    /// Creates a service; the allocator may be shared with other services.
    pub fn new(sessions: F, allocator: Arc<SequenceAllocator<S>>) -> Self {
        Self {
            sessions,
            allocator,
        }
    }

    pub fn sessions(&self) -> &F {
        &self.sessions
    }

    pub fn allocator(&self) -> &Arc<SequenceAllocator<S>> {
        &self.allocator
    }

    pub fn register_sequence(&self, name: &str, increment: u64) -> ServiceResult<()> {
        self.allocator.register(name, increment)?;
        Ok(())
    }

    pub fn next_id(&self, sequence: &str) -> ServiceResult<u64> {
        Ok(self.allocator.next_id(sequence)?)
    }

    pub fn next_ids(&self, sequence: &str, count: usize) -> ServiceResult<Vec<u64>> {
        Ok(self.allocator.allocate(sequence, count)?)
    }

    /// Runs `work` in a fresh session transaction.
    ///
    /// Errors roll back and come back classified; panics roll back and keep
    /// unwinding.
    pub fn transaction<T, W>(&self, work: W) -> ServiceResult<T>
    where
        W: FnOnce(&mut F::Session) -> RepoResult<T>,
    {
        let mut session = self.sessions.open_session()?;
        let value = session.transaction(work)?;
        session.close()?;
        Ok(value)
    }

    pub fn sync(&self, schemas: &[&RecordSchema]) -> ServiceResult<()> {
        if schemas.is_empty() {
            return Ok(());
        }
        self.transaction(|session| session.sync(schemas))
    }

    pub fn get<R: Record + ?Sized>(&self, dest: &mut R, query: &GetQuery) -> ServiceResult<bool> {
        self.transaction(|session| session.get(dest, query))
    }

    pub fn find<R: Record + Default>(
        &self,
        probe: Option<&R>,
        query: &FindQuery,
    ) -> ServiceResult<Vec<R>> {
        self.transaction(|session| session.find(probe, query))
    }

    pub fn count<R: Record + ?Sized>(
        &self,
        record: &R,
        filter: Option<&Filter>,
    ) -> ServiceResult<u64> {
        self.transaction(|session| session.count(record, filter))
    }

    /// Inserts all records in one transaction, assigning ids to those
    /// without one.
    pub fn insert<R: Record + ?Sized>(&self, records: &mut [&mut R]) -> ServiceResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let assigned = self.assign_ids(records, |_| true)?;

        let outcome = self.transaction(|session| {
            let refs: Vec<&R> = records.iter().map(|record| &**record).collect();
            session.insert(refs.as_slice())
        });
        if outcome.is_err() {
            reset_ids(records, &assigned);
        }
        outcome
    }

    /// Inserts in chunks of `BATCH_INSERT_CHUNK`, one transaction each.
    ///
    /// Chunks committed before a failure stay committed.
    pub fn batch_insert<R: Record + ?Sized>(&self, records: &mut [&mut R]) -> ServiceResult<u64> {
        let mut total = 0;
        for (index, chunk) in records.chunks_mut(BATCH_INSERT_CHUNK).enumerate() {
            match self.insert(chunk) {
                Ok(affected) => {
                    total += affected;
                    info!(
                        "event=batch_insert module=service status=ok chunk={} records={} total={}",
                        index,
                        chunk.len(),
                        total
                    );
                }
                Err(err) => {
                    error!(
                        "event=batch_insert module=service status=error chunk={index} committed={total} error={err}"
                    );
                    return Err(err);
                }
            }
        }
        Ok(total)
    }

    pub fn update<R: Record + ?Sized>(
        &self,
        record: &R,
        columns: &[&str],
        filter: Option<&Filter>,
    ) -> ServiceResult<u64> {
        self.transaction(|session| session.update(record, columns, filter))
    }

    /// Inserts records without an id (assigning one) and fully updates the
    /// rest.
    pub fn upsert<R: Record + ?Sized>(&self, records: &mut [&mut R]) -> ServiceResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let assigned = self.assign_ids(records, |_| true)?;

        let outcome = self.transaction(|session| {
            let mut affected = 0;
            for (index, record) in records.iter().enumerate() {
                let record: &R = record;
                affected += if assigned.contains(&index) {
                    session.insert(&[record])?
                } else {
                    session.update(record, &[], None)?
                };
            }
            Ok(affected)
        });
        if outcome.is_err() {
            reset_ids(records, &assigned);
        }
        outcome
    }

    pub fn delete<R: Record + ?Sized>(
        &self,
        record: &R,
        filter: Option<&Filter>,
    ) -> ServiceResult<u64> {
        self.transaction(|session| session.delete(record, filter))
    }

    /// Persists each entity according to its state, all in one transaction.
    ///
    /// `New` inserts (assigning an id when unset), `Modified` fully updates,
    /// `Deleted` deletes and `None` is skipped. After commit `New` and
    /// `Modified` entities are clean (`None`); `Deleted` stays terminal.
    ///
    /// A `Deleted` entity without an id is deleted by its non-zero fields,
    /// which can match and remove several rows.
    pub fn save<R: Entity + ?Sized>(&self, records: &mut [&mut R]) -> ServiceResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let started_at = Instant::now();
        let assigned = self.assign_ids(records, |record| record.state() == EntityState::New)?;

        let outcome = self.transaction(|session| {
            let mut affected = 0;
            for record in records.iter() {
                let record: &R = record;
                affected += match record.state() {
                    EntityState::New => session.insert(&[record])?,
                    EntityState::Modified => session.update(record, &[], None)?,
                    EntityState::Deleted => session.delete(record, None)?,
                    EntityState::None => 0,
                };
            }
            Ok(affected)
        });

        match outcome {
            Ok(affected) => {
                for record in records.iter_mut() {
                    if matches!(record.state(), EntityState::New | EntityState::Modified) {
                        record.force_state(EntityState::None);
                    }
                }
                info!(
                    "event=entity_save module=service status=ok records={} affected={} ids_assigned={} duration_ms={}",
                    records.len(),
                    affected,
                    assigned.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(affected)
            }
            Err(err) => {
                reset_ids(records, &assigned);
                error!(
                    "event=entity_save module=service status=error records={} error={}",
                    records.len(),
                    err
                );
                Err(err)
            }
        }
    }

    pub fn exec(&self, clause: &str, params: &[FieldValue]) -> ServiceResult<ExecResult> {
        self.transaction(|session| session.exec(clause, params))
    }

    pub fn query(&self, clause: &str, params: &[FieldValue]) -> ServiceResult<Vec<RawRow>> {
        self.transaction(|session| session.query(clause, params))
    }

    /// Gives every selected record lacking an id a fresh one, one
    /// `allocate` call per sequence. Returns the indexes it filled.
    fn assign_ids<R, P>(&self, records: &mut [&mut R], selected: P) -> ServiceResult<Vec<usize>>
    where
        R: Record + ?Sized,
        P: Fn(&R) -> bool,
    {
        let mut wanted: BTreeMap<&'static str, Vec<usize>> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            let record: &R = record;
            if !selected(record) || record.id().is_set() {
                continue;
            }
            let schema = record.schema();
            let sequence = schema.sequence.ok_or_else(|| {
                ServiceError::Validation(format!(
                    "record for `{}` has no id and no sequence",
                    schema.table
                ))
            })?;
            wanted.entry(sequence).or_default().push(index);
        }

        let mut assigned = Vec::new();
        for (sequence, indexes) in wanted {
            let ids = match self.allocator.allocate(sequence, indexes.len()) {
                Ok(ids) => ids,
                Err(err) => {
                    reset_ids(records, &assigned);
                    return Err(err.into());
                }
            };
            for (index, id) in indexes.into_iter().zip(ids) {
                records[index].set_id(IdValue::from_u64(id));
                assigned.push(index);
            }
        }
        assigned.sort_unstable();
        Ok(assigned)
    }
}

/// Decodes a JSON payload holding either one record or an array of them.
///
/// The array shape is tried first; when that fails the payload is decoded
/// as a single record.
pub fn parse_json<R: DeserializeOwned>(data: &[u8]) -> ServiceResult<Vec<R>> {
    match serde_json::from_slice::<Vec<R>>(data) {
        Ok(records) => Ok(records),
        Err(_) => serde_json::from_slice::<R>(data)
            .map(|record| vec![record])
            .map_err(|err| ServiceError::Validation(format!("invalid entity payload: {err}"))),
    }
}

fn reset_ids<R: Record + ?Sized>(records: &mut [&mut R], assigned: &[usize]) {
    for index in assigned {
        records[*index].set_id(IdValue::Unset);
    }
}

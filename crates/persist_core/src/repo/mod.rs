//! Backend-agnostic repository session contract.
//!
//! # Responsibility
//! - Define the transactional CRUD surface every storage backend implements.
//! - Own the panic-safe transaction wrapper shared by all backends.
//!
//! # Invariants
//! - `transaction` commits only when the callback returns `Ok`; any error
//!   rolls back and is returned unchanged.
//! - A panic inside `transaction` rolls back, then resumes unwinding.
//! - Nested `transaction` calls on one session are rejected, never flattened
//!   into partial commits.
//! - While a `transaction` callback runs, manual `begin`/`commit`/`rollback`
//!   on the session are refused; only the wrapper ends the transaction.

use crate::db::DbError;
use crate::model::record::{Record, RecordSchema};
use crate::model::value::FieldValue;
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

pub mod sqlite;

pub use sqlite::{SqliteSession, SqliteSessionFactory};

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for session and record operations.
#[derive(Debug)]
pub enum RepoError {
    /// Caller input rejected before any statement ran.
    Validation(String),
    NotFound(String),
    Db(DbError),
    InvalidData(String),
    NestedTransaction,
    NoActiveTransaction,
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "invalid repository request: {message}"),
            Self::NotFound(what) => write!(f, "record not found: {what}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::NestedTransaction => write!(f, "session already has an active transaction"),
            Self::NoActiveTransaction => write!(f, "session has no active transaction"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Parameterized predicate, e.g. `clause = "price > ? AND code = ?"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub clause: String,
    pub params: Vec<FieldValue>,
}

impl Filter {
    pub fn new(clause: impl Into<String>, params: Vec<FieldValue>) -> Self {
        Self {
            clause: clause.into(),
            params,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clause.trim().is_empty()
    }
}

/// Options for single-record reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetQuery {
    /// Request a write-reserving read where the backend supports one.
    pub locked: bool,
    pub order_by: Option<String>,
    /// When absent, the destination's non-zero fields are the conditions.
    pub filter: Option<Filter>,
}

impl GetQuery {
    pub fn by(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }
}

/// Options for multi-record reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub order_by: Option<String>,
    pub offset: u32,
    pub limit: Option<u32>,
    pub filter: Option<Filter>,
}

/// Outcome of a raw `exec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

/// One row of a raw `query`: ordered column name to raw byte value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    pub columns: Vec<(String, Vec<u8>)>,
}

impl RawRow {
    pub fn get(&self, column: &str) -> Option<&[u8]> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_slice())
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column)
            .and_then(|value| std::str::from_utf8(value).ok())
    }
}

/// Transactional CRUD contract implemented once per storage backend.
pub trait RepositorySession {
    /// Ensures storage layout matches the given record shapes.
    fn sync(&mut self, schemas: &[&RecordSchema]) -> RepoResult<()>;

    /// Loads one record into `dest`; returns whether a row matched.
    fn get<R: Record + ?Sized>(&mut self, dest: &mut R, query: &GetQuery) -> RepoResult<bool>;

    /// Loads all matching records. `probe` supplies equality conditions from
    /// its non-zero fields when no filter is given.
    fn find<R: Record + Default>(
        &mut self,
        probe: Option<&R>,
        query: &FindQuery,
    ) -> RepoResult<Vec<R>>;

    fn insert<R: Record + ?Sized>(&mut self, records: &[&R]) -> RepoResult<u64>;

    /// Writes `record`.
    ///
    /// - Non-empty `columns`: only those columns.
    /// - Otherwise, with a filter: the record's non-zero fields.
    /// - Otherwise: every column, matched by id.
    fn update<R: Record + ?Sized>(
        &mut self,
        record: &R,
        columns: &[&str],
        filter: Option<&Filter>,
    ) -> RepoResult<u64>;

    fn delete<R: Record + ?Sized>(&mut self, record: &R, filter: Option<&Filter>)
        -> RepoResult<u64>;

    fn exec(&mut self, clause: &str, params: &[FieldValue]) -> RepoResult<ExecResult>;

    fn query(&mut self, clause: &str, params: &[FieldValue]) -> RepoResult<Vec<RawRow>>;

    fn count<R: Record + ?Sized>(&mut self, record: &R, filter: Option<&Filter>)
        -> RepoResult<u64>;

    fn in_transaction(&self) -> bool;

    /// Whether `transaction` currently owns the open transaction.
    fn is_managed(&self) -> bool;

    /// Set and cleared by `transaction` around its callback. Backends must
    /// refuse `begin`, `commit` and `rollback` with `NestedTransaction`
    /// while it is set.
    fn set_managed(&mut self, managed: bool);

    fn begin(&mut self) -> RepoResult<()>;
    fn commit(&mut self) -> RepoResult<()>;
    fn rollback(&mut self) -> RepoResult<()>;
    fn close(self) -> RepoResult<()>
    where
        Self: Sized;

    /// Runs `work` inside one transaction on this session.
    ///
    /// # Errors
    /// - `NestedTransaction` when a transaction is already active.
    /// - Any error from `work` (after rollback) or from commit.
    ///
    /// # Panics
    /// Re-raises a panic from `work` after rolling back.
    fn transaction<T, F>(&mut self, work: F) -> RepoResult<T>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> RepoResult<T>,
    {
        if self.in_transaction() || self.is_managed() {
            return Err(RepoError::NestedTransaction);
        }

        let trace_id = uuid::Uuid::new_v4();
        let started_at = Instant::now();
        self.begin()?;
        info!("event=tx_begin module=repo status=ok tx={trace_id}");

        self.set_managed(true);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut *self)));
        self.set_managed(false);

        match outcome {
            Ok(Ok(value)) => match self.commit() {
                Ok(()) => {
                    info!(
                        "event=tx_commit module=repo status=ok tx={} duration_ms={}",
                        trace_id,
                        started_at.elapsed().as_millis()
                    );
                    Ok(value)
                }
                Err(err) => {
                    error!("event=tx_commit module=repo status=error tx={trace_id} error={err}");
                    rollback_quietly(self, trace_id);
                    Err(err)
                }
            },
            Ok(Err(err)) => {
                warn!("event=tx_rollback module=repo status=start tx={trace_id} cause={err}");
                rollback_quietly(self, trace_id);
                Err(err)
            }
            Err(payload) => {
                error!("event=tx_panic_rollback module=repo status=start tx={trace_id}");
                rollback_quietly(self, trace_id);
                panic::resume_unwind(payload)
            }
        }
    }
}

fn rollback_quietly<S: RepositorySession>(session: &mut S, trace_id: uuid::Uuid) {
    if !session.in_transaction() {
        return;
    }
    match session.rollback() {
        Ok(()) => info!("event=tx_rollback module=repo status=ok tx={trace_id}"),
        Err(err) => error!("event=tx_rollback module=repo status=error tx={trace_id} error={err}"),
    }
}

/// Opens fresh sessions against one configured backend.
pub trait SessionFactory: Send + Sync {
    type Session: RepositorySession;

    fn open_session(&self) -> RepoResult<Self::Session>;
}

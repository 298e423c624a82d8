//! Entity persistence core.
//!
//! Block identifier allocation, entity graph change tracking, a
//! backend-agnostic transactional repository contract with a SQLite
//! reference backend, and the orchestrator that ties them together.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod sequence;
pub mod service;
pub mod tracker;

pub use config::{ConfigError, PersistConfig, SequenceStrategy};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{EntityMeta, EntityState, GraphKeyed, Identifiable, Stateful};
pub use model::record::{ColumnDef, ColumnType, Entity, Record, RecordSchema};
pub use model::value::{FieldRow, FieldValue, IdValue};
pub use repo::{
    ExecResult, Filter, FindQuery, GetQuery, RawRow, RepoError, RepoResult, RepositorySession,
    SessionFactory, SqliteSession, SqliteSessionFactory,
};
pub use sequence::{
    MemorySequenceStore, SequenceAllocator, SequenceError, SequenceResult, SequenceStore,
    SqliteSequenceStore,
};
pub use service::{parse_json, PersistenceService, ServiceError, ServiceResult};
pub use tracker::{ContextOptions, EntityContext, EntityDiff, TrackError, Trackable};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

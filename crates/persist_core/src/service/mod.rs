//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate allocator and repository calls into transactional
//!   persistence entry points.
//! - Keep callers decoupled from the configured storage backend.

pub mod persistence_service;

pub use persistence_service::{
    parse_json, PersistenceService, ServiceError, ServiceResult, BATCH_INSERT_CHUNK,
};

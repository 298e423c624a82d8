//! Entity model shared by the allocator, tracker, repositories and services.
//!
//! # Responsibility
//! - Define value types, lifecycle state and capability traits.
//! - Describe record shapes statically so no layer reflects on field names.
//!
//! # Invariants
//! - Every persisted record exposes its identity through `Identifiable`.
//! - State transitions go through `Stateful`, which enforces the `New` guard.

pub mod entity;
pub mod record;
pub mod sequence;
pub mod value;

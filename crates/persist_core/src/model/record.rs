//! Record shape descriptors.
//!
//! # Responsibility
//! - Describe how an entity maps to a storage table without reflection.
//! - Provide the write/read hooks backends use to move field values.
//!
//! # Invariants
//! - `to_fields` returns every column in `RecordSchema::columns`, including
//!   the id column.
//! - The id column is the primary key and is listed in `columns`.

use crate::model::entity::{Identifiable, Stateful};
use crate::model::value::{FieldRow, FieldValue};
use crate::repo::RepoResult;

/// Storage affinity for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }
}

/// One column in a record schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnType,
    pub not_null: bool,
    pub unique: bool,
}

impl ColumnDef {
    pub const fn new(name: &'static str, kind: ColumnType) -> Self {
        Self {
            name,
            kind,
            not_null: false,
            unique: false,
        }
    }

    pub const fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Table-level description of a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSchema {
    pub table: &'static str,
    pub id_column: &'static str,
    /// Sequence used to mint ids for new records; `None` when callers always
    /// provide the id themselves.
    pub sequence: Option<&'static str>,
    pub columns: &'static [ColumnDef],
}

impl RecordSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// A persistable record.
pub trait Record: Identifiable {
    fn schema(&self) -> &'static RecordSchema;

    /// Current column values, in schema order.
    fn to_fields(&self) -> Vec<(&'static str, FieldValue)>;

    /// Overwrites this record from a stored row.
    fn load_fields(&mut self, row: &FieldRow) -> RepoResult<()>;
}

/// A record whose lifecycle state drives save dispatch.
pub trait Entity: Record + Stateful {}

impl<T: Record + Stateful> Entity for T {}

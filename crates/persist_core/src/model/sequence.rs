//! Persisted sequence counter row.
//!
//! # Invariants
//! - `name` is the primary key.
//! - `current_val` only moves forward; each fetch advances it by
//!   `increment` (or up to `min_value` when that is larger).

use crate::model::entity::Identifiable;
use crate::model::record::{ColumnDef, ColumnType, Record, RecordSchema};
use crate::model::value::{FieldRow, FieldValue, IdValue};
use crate::repo::RepoResult;
use serde::{Deserialize, Serialize};

pub const SEQUENCE_TABLE: &str = "sequences";

const SEQUENCE_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("name", ColumnType::Text).not_null(),
    ColumnDef::new("min_value", ColumnType::Integer).not_null(),
    ColumnDef::new("increment", ColumnType::Integer).not_null(),
    ColumnDef::new("current_val", ColumnType::Integer).not_null(),
];

static SEQUENCE_SCHEMA: RecordSchema = RecordSchema {
    table: SEQUENCE_TABLE,
    id_column: "name",
    sequence: None,
    columns: SEQUENCE_COLUMNS,
};

/// Named monotonic counter used to mint identifier blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRow {
    pub name: String,
    pub min_value: u64,
    pub increment: u64,
    pub current_val: u64,
}

impl SequenceRow {
    pub fn new(name: impl Into<String>, increment: u64, min_value: u64) -> Self {
        Self {
            name: name.into(),
            min_value,
            increment,
            current_val: 0,
        }
    }

    pub fn schema_ref() -> &'static RecordSchema {
        &SEQUENCE_SCHEMA
    }

    /// High-water mark the next fetch would produce.
    ///
    /// A zero increment still advances by one so a misconfigured row can
    /// never hand out the same block twice.
    pub fn next_high_water_mark(&self) -> u64 {
        let step = self.increment.max(1);
        self.current_val.saturating_add(step).max(self.min_value)
    }
}

impl Identifiable for SequenceRow {
    fn id(&self) -> IdValue {
        IdValue::from_text(self.name.as_str())
    }

    fn set_id(&mut self, id: IdValue) {
        self.name = id.to_string();
    }
}

impl Record for SequenceRow {
    fn schema(&self) -> &'static RecordSchema {
        &SEQUENCE_SCHEMA
    }

    fn to_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", FieldValue::Text(self.name.clone())),
            ("min_value", FieldValue::Unsigned(self.min_value)),
            ("increment", FieldValue::Unsigned(self.increment)),
            ("current_val", FieldValue::Unsigned(self.current_val)),
        ]
    }

    fn load_fields(&mut self, row: &FieldRow) -> RepoResult<()> {
        self.name = row.get_text("name")?;
        self.min_value = row.get_u64("min_value")?;
        self.increment = row.get_u64("increment")?;
        self.current_val = row.get_u64("current_val")?;
        Ok(())
    }
}

#![allow(dead_code)]

use persist_core::model::entity::{EntityMeta, EntityState, GraphKeyed, Identifiable, Stateful};
use persist_core::model::record::{ColumnDef, ColumnType, Record, RecordSchema};
use persist_core::model::value::{FieldRow, FieldValue, IdValue};
use persist_core::repo::RepoResult;
use persist_core::tracker::Trackable;
use serde::Deserialize;

pub const ORDER_SEQUENCE: &str = "seq_base";
pub const LINE_SEQUENCE: &str = "seq_line";

const ORDER_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("id", ColumnType::Integer),
    ColumnDef::new("code", ColumnType::Text).not_null().unique(),
    ColumnDef::new("amount", ColumnType::Integer).not_null(),
    ColumnDef::new("note", ColumnType::Text),
];

pub static ORDER_SCHEMA: RecordSchema = RecordSchema {
    table: "orders",
    id_column: "id",
    sequence: Some(ORDER_SEQUENCE),
    columns: ORDER_COLUMNS,
};

const LINE_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("id", ColumnType::Integer),
    ColumnDef::new("order_id", ColumnType::Integer).not_null(),
    ColumnDef::new("sku", ColumnType::Text).not_null(),
    ColumnDef::new("qty", ColumnType::Integer).not_null(),
];

pub static LINE_SCHEMA: RecordSchema = RecordSchema {
    table: "order_lines",
    id_column: "id",
    sequence: Some(LINE_SEQUENCE),
    columns: LINE_COLUMNS,
};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Order {
    pub id: u64,
    pub code: String,
    pub amount: i64,
    pub note: Option<String>,
    #[serde(skip)]
    pub meta: EntityMeta,
    #[serde(skip)]
    pub lines: Vec<OrderLine>,
}

impl Order {
    pub fn new(code: &str, amount: i64) -> Self {
        Self {
            code: code.to_string(),
            amount,
            meta: EntityMeta::new_entity(),
            ..Self::default()
        }
    }
}

impl Identifiable for Order {
    fn id(&self) -> IdValue {
        IdValue::from_u64(self.id)
    }

    fn set_id(&mut self, id: IdValue) {
        self.id = id.as_u64().unwrap_or_default();
    }
}

impl Stateful for Order {
    fn state(&self) -> EntityState {
        self.meta.state()
    }

    fn set_state(&mut self, next: EntityState) {
        self.meta.set_state(next);
    }

    fn force_state(&mut self, next: EntityState) {
        self.meta.force_state(next);
    }
}

impl GraphKeyed for Order {
    fn entity_key(&self) -> Option<&str> {
        self.meta.entity_key()
    }
}

impl Record for Order {
    fn schema(&self) -> &'static RecordSchema {
        &ORDER_SCHEMA
    }

    fn to_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("id", FieldValue::Unsigned(self.id)),
            ("code", FieldValue::Text(self.code.clone())),
            ("amount", FieldValue::Integer(self.amount)),
            ("note", FieldValue::from(self.note.clone())),
        ]
    }

    fn load_fields(&mut self, row: &FieldRow) -> RepoResult<()> {
        self.id = row.get_u64("id")?;
        self.code = row.get_text("code")?;
        self.amount = row.get_i64("amount")?;
        self.note = row.get_opt_text("note")?;
        self.meta = EntityMeta::loaded();
        Ok(())
    }
}

impl Trackable for Order {
    fn kind(&self) -> &'static str {
        ORDER_SCHEMA.table
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        self.to_fields()
    }

    fn children(&self) -> Vec<&dyn Trackable> {
        self.lines
            .iter()
            .map(|line| line as &dyn Trackable)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderLine {
    pub id: u64,
    pub order_id: u64,
    pub sku: String,
    pub qty: i64,
    pub meta: EntityMeta,
}

impl OrderLine {
    pub fn new(sku: &str, qty: i64) -> Self {
        Self {
            sku: sku.to_string(),
            qty,
            meta: EntityMeta::new_entity(),
            ..Self::default()
        }
    }
}

impl Identifiable for OrderLine {
    fn id(&self) -> IdValue {
        IdValue::from_u64(self.id)
    }

    fn set_id(&mut self, id: IdValue) {
        self.id = id.as_u64().unwrap_or_default();
    }
}

impl Stateful for OrderLine {
    fn state(&self) -> EntityState {
        self.meta.state()
    }

    fn set_state(&mut self, next: EntityState) {
        self.meta.set_state(next);
    }

    fn force_state(&mut self, next: EntityState) {
        self.meta.force_state(next);
    }
}

impl GraphKeyed for OrderLine {
    fn entity_key(&self) -> Option<&str> {
        self.meta.entity_key()
    }
}

impl Record for OrderLine {
    fn schema(&self) -> &'static RecordSchema {
        &LINE_SCHEMA
    }

    fn to_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("id", FieldValue::Unsigned(self.id)),
            ("order_id", FieldValue::Unsigned(self.order_id)),
            ("sku", FieldValue::Text(self.sku.clone())),
            ("qty", FieldValue::Integer(self.qty)),
        ]
    }

    fn load_fields(&mut self, row: &FieldRow) -> RepoResult<()> {
        self.id = row.get_u64("id")?;
        self.order_id = row.get_u64("order_id")?;
        self.sku = row.get_text("sku")?;
        self.qty = row.get_i64("qty")?;
        self.meta = EntityMeta::loaded();
        Ok(())
    }
}

impl Trackable for OrderLine {
    fn kind(&self) -> &'static str {
        LINE_SCHEMA.table
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        self.to_fields()
    }
}

/// Order with explicit id, as if loaded from storage.
pub fn stored_order(id: u64, code: &str, amount: i64) -> Order {
    Order {
        id,
        code: code.to_string(),
        amount,
        meta: EntityMeta::loaded(),
        ..Order::default()
    }
}

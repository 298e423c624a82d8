//! Storage-neutral field values.
//!
//! # Responsibility
//! - Carry record column values between entities, the change tracker and
//!   storage backends without runtime reflection.
//! - Bridge values to and from SQLite bindings.
//!
//! # Invariants
//! - `Unsigned` values above `i64::MAX` cannot be bound to SQLite and fail
//!   conversion instead of wrapping.
//! - `IdValue::Unset` is the only representation of "no identifier"; zero and
//!   empty strings normalize to it.

use crate::repo::{RepoError, RepoResult};
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// One column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl FieldValue {
    /// Returns whether this value is the zero value of its type.
    ///
    /// Zero fields are skipped when a record is used as a query probe and
    /// when a partial update writes only populated fields.
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(value) => !value,
            Self::Integer(value) => *value == 0,
            Self::Unsigned(value) => *value == 0,
            Self::Real(value) => *value == 0.0,
            Self::Text(value) => value.is_empty(),
            Self::Blob(value) => value.is_empty(),
        }
    }

    /// Renders the value the way raw query rows expose it.
    pub fn to_raw_bytes(&self) -> Vec<u8> {
        match self {
            Self::Null => Vec::new(),
            Self::Bool(value) => if *value { b"1".to_vec() } else { b"0".to_vec() },
            Self::Integer(value) => value.to_string().into_bytes(),
            Self::Unsigned(value) => value.to_string().into_bytes(),
            Self::Real(value) => value.to_string().into_bytes(),
            Self::Text(value) => value.as_bytes().to_vec(),
            Self::Blob(value) => value.clone(),
        }
    }

    pub(crate) fn from_value_ref(value: ValueRef<'_>) -> RepoResult<Self> {
        Ok(match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(value) => Self::Integer(value),
            ValueRef::Real(value) => Self::Real(value),
            ValueRef::Text(bytes) => Self::Text(
                std::str::from_utf8(bytes)
                    .map_err(|_| RepoError::InvalidData("text column is not UTF-8".to_string()))?
                    .to_string(),
            ),
            ValueRef::Blob(bytes) => Self::Blob(bytes.to_vec()),
        })
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let output = match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Bool(value) => ToSqlOutput::Owned(Value::Integer(i64::from(*value))),
            Self::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            Self::Unsigned(value) => {
                let value = i64::try_from(*value)
                    .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
                ToSqlOutput::Owned(Value::Integer(value))
            }
            Self::Real(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Self::Blob(value) => ToSqlOutput::Borrowed(ValueRef::Blob(value.as_slice())),
        };
        Ok(output)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::Unsigned(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Column values read back from storage, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldRow {
    values: BTreeMap<String, FieldValue>,
}

impl FieldRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: FieldValue) {
        self.values.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.values.get(column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn required(&self, column: &str) -> RepoResult<&FieldValue> {
        self.values
            .get(column)
            .ok_or_else(|| RepoError::InvalidData(format!("missing column `{column}`")))
    }

    pub fn get_i64(&self, column: &str) -> RepoResult<i64> {
        match self.required(column)? {
            FieldValue::Integer(value) => Ok(*value),
            FieldValue::Unsigned(value) => i64::try_from(*value).map_err(|_| {
                RepoError::InvalidData(format!("column `{column}` out of i64 range"))
            }),
            FieldValue::Bool(value) => Ok(i64::from(*value)),
            FieldValue::Null => Ok(0),
            other => Err(type_mismatch(column, "integer", other)),
        }
    }

    pub fn get_u64(&self, column: &str) -> RepoResult<u64> {
        match self.required(column)? {
            FieldValue::Unsigned(value) => Ok(*value),
            FieldValue::Integer(value) => u64::try_from(*value).map_err(|_| {
                RepoError::InvalidData(format!("negative value {value} in unsigned column `{column}`"))
            }),
            FieldValue::Null => Ok(0),
            other => Err(type_mismatch(column, "unsigned integer", other)),
        }
    }

    pub fn get_f64(&self, column: &str) -> RepoResult<f64> {
        match self.required(column)? {
            FieldValue::Real(value) => Ok(*value),
            FieldValue::Integer(value) => Ok(*value as f64),
            FieldValue::Null => Ok(0.0),
            other => Err(type_mismatch(column, "real", other)),
        }
    }

    pub fn get_bool(&self, column: &str) -> RepoResult<bool> {
        match self.required(column)? {
            FieldValue::Bool(value) => Ok(*value),
            FieldValue::Integer(0) | FieldValue::Null => Ok(false),
            FieldValue::Integer(1) => Ok(true),
            other => Err(type_mismatch(column, "bool", other)),
        }
    }

    pub fn get_text(&self, column: &str) -> RepoResult<String> {
        Ok(self.get_opt_text(column)?.unwrap_or_default())
    }

    pub fn get_opt_text(&self, column: &str) -> RepoResult<Option<String>> {
        match self.required(column)? {
            FieldValue::Text(value) => Ok(Some(value.clone())),
            FieldValue::Null => Ok(None),
            other => Err(type_mismatch(column, "text", other)),
        }
    }
}

fn type_mismatch(column: &str, expected: &str, actual: &FieldValue) -> RepoError {
    RepoError::InvalidData(format!(
        "column `{column}` expected {expected}, found {actual:?}"
    ))
}

/// Identity of a record: numeric, textual, or not yet assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdValue {
    Unset,
    Integer(u64),
    Text(String),
}

impl IdValue {
    pub fn from_u64(value: u64) -> Self {
        if value == 0 {
            Self::Unset
        } else {
            Self::Integer(value)
        }
    }

    pub fn from_text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            Self::Unset
        } else {
            Self::Text(value)
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, Self::Unset)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn to_field(&self) -> FieldValue {
        match self {
            Self::Unset => FieldValue::Null,
            Self::Integer(value) => FieldValue::Unsigned(*value),
            Self::Text(value) => FieldValue::Text(value.clone()),
        }
    }
}

impl Display for IdValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => Ok(()),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

//! SQLite reference backend for `RepositorySession`.
//!
//! # Responsibility
//! - Translate record-shaped CRUD calls into parameterized SQL.
//! - Open one connection per session so callers never share a transaction.
//!
//! # Invariants
//! - Identifiers (tables, columns, `ORDER BY` terms) are validated before
//!   they are spliced into SQL; values are always bound as parameters.
//! - Updates and deletes never run without an id or a condition.
//! - Transactions use `BEGIN IMMEDIATE`, which also backs `locked` reads.

use crate::db::{open_target, DbTarget, DEFAULT_BUSY_TIMEOUT};
use crate::model::record::{Record, RecordSchema};
use crate::model::value::{FieldRow, FieldValue};
use crate::repo::{
    ExecResult, Filter, FindQuery, GetQuery, RawRow, RepoError, RepoResult, RepositorySession,
    SessionFactory,
};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));
static TX_CONTROL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(begin|commit|end|rollback|savepoint|release)\b")
        .expect("valid transaction control regex")
});
static ORDER_BY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*[a-z_][a-z0-9_]*(\s+(asc|desc))?(\s*,\s*[a-z_][a-z0-9_]*(\s+(asc|desc))?)*\s*$",
    )
    .expect("valid order-by regex")
});

/// Opens `SqliteSession`s against one database target.
#[derive(Clone)]
pub struct SqliteSessionFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    target: DbTarget,
    busy_timeout: Duration,
    // Keeps a shared in-memory database alive between sessions.
    _keeper: Option<Mutex<Connection>>,
}

impl SqliteSessionFactory {
    /// Creates a factory and bootstraps the target once.
    pub fn new(target: DbTarget, busy_timeout: Duration) -> RepoResult<Self> {
        let conn = open_target(&target, busy_timeout)?;
        let keeper = match target {
            DbTarget::SharedMemory(_) => Some(Mutex::new(conn)),
            DbTarget::File(_) => None,
        };
        Ok(Self {
            inner: Arc::new(FactoryInner {
                target,
                busy_timeout,
                _keeper: keeper,
            }),
        })
    }

    pub fn file(path: impl AsRef<Path>) -> RepoResult<Self> {
        Self::new(DbTarget::file(path), DEFAULT_BUSY_TIMEOUT)
    }

    /// Factory over a fresh private shared-memory database.
    pub fn memory() -> RepoResult<Self> {
        Self::new(DbTarget::unique_memory(), DEFAULT_BUSY_TIMEOUT)
    }

    pub fn target(&self) -> &DbTarget {
        &self.inner.target
    }
}

impl SessionFactory for SqliteSessionFactory {
    type Session = SqliteSession;

    fn open_session(&self) -> RepoResult<SqliteSession> {
        let conn = open_target(&self.inner.target, self.inner.busy_timeout)?;
        Ok(SqliteSession::new(conn))
    }
}

/// One SQLite connection used as a repository session.
pub struct SqliteSession {
    conn: Connection,
    managed: bool,
}

impl SqliteSession {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            managed: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn select_rows(&self, sql: &str, params: &[FieldValue]) -> RepoResult<Vec<FieldRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut result = Vec::new();

        while let Some(row) = rows.next()? {
            let mut fields = FieldRow::new();
            for (index, name) in names.iter().enumerate() {
                fields.insert(name.as_str(), FieldValue::from_value_ref(row.get_ref(index)?)?);
            }
            result.push(fields);
        }

        Ok(result)
    }

    fn create_table(&self, schema: &RecordSchema) -> RepoResult<()> {
        let mut definitions = Vec::with_capacity(schema.columns.len());
        for column in schema.columns {
            let mut definition = format!("{} {}", quote(column.name), column.kind.sql_type());
            if column.name == schema.id_column {
                definition.push_str(" PRIMARY KEY NOT NULL");
            } else {
                if column.not_null {
                    definition.push_str(" NOT NULL");
                }
                if column.unique {
                    definition.push_str(" UNIQUE");
                }
            }
            definitions.push(definition);
        }

        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            quote(schema.table),
            definitions.join(", ")
        ))?;
        Ok(())
    }

    fn existing_columns(&self, table: &str) -> RepoResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({});", quote(table)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>("name"))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }
}

impl RepositorySession for SqliteSession {
    fn sync(&mut self, schemas: &[&RecordSchema]) -> RepoResult<()> {
        for schema in schemas {
            validate_schema(schema)?;
            let existing = self.existing_columns(schema.table)?;
            if existing.is_empty() {
                self.create_table(schema)?;
                info!(
                    "event=schema_sync module=repo status=ok table={} action=create",
                    schema.table
                );
                continue;
            }

            for column in schema.columns {
                if existing.iter().any(|name| name == column.name) {
                    continue;
                }
                if column.unique || column.not_null {
                    warn!(
                        "event=schema_sync module=repo status=degraded table={} column={} reason=constraint_not_addable",
                        schema.table, column.name
                    );
                }
                self.conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {};",
                    quote(schema.table),
                    quote(column.name),
                    column.kind.sql_type()
                ))?;
                info!(
                    "event=schema_sync module=repo status=ok table={} action=add_column column={}",
                    schema.table, column.name
                );
            }
        }
        Ok(())
    }

    fn get<R: Record + ?Sized>(&mut self, dest: &mut R, query: &GetQuery) -> RepoResult<bool> {
        let schema = dest.schema();
        validate_schema(schema)?;

        let (conditions, params) = match non_empty(query.filter.as_ref()) {
            Some(filter) => filter_conditions(filter),
            None => probe_conditions(&dest.to_fields()),
        };
        let mut sql = select_sql(schema, &conditions);
        push_order_by(&mut sql, query.order_by.as_deref())?;
        sql.push_str(" LIMIT 1");

        if query.locked && !self.in_transaction() {
            debug!(
                "event=locked_read module=repo status=skipped table={} reason=no_transaction",
                schema.table
            );
        }

        match self.select_rows(&sql, &params)?.into_iter().next() {
            Some(row) => {
                dest.load_fields(&row)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find<R: Record + Default>(
        &mut self,
        probe: Option<&R>,
        query: &FindQuery,
    ) -> RepoResult<Vec<R>> {
        let template = R::default();
        let schema = template.schema();
        validate_schema(schema)?;

        let (conditions, mut params) = match (non_empty(query.filter.as_ref()), probe) {
            (Some(filter), _) => filter_conditions(filter),
            (None, Some(probe)) => probe_conditions(&probe.to_fields()),
            (None, None) => (Vec::new(), Vec::new()),
        };
        let mut sql = select_sql(schema, &conditions);
        push_order_by(&mut sql, query.order_by.as_deref())?;

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            params.push(FieldValue::Integer(i64::from(limit)));
            if query.offset > 0 {
                sql.push_str(" OFFSET ?");
                params.push(FieldValue::Integer(i64::from(query.offset)));
            }
        } else if query.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            params.push(FieldValue::Integer(i64::from(query.offset)));
        }

        let rows = self.select_rows(&sql, &params)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record = R::default();
            record.load_fields(&row)?;
            records.push(record);
        }
        Ok(records)
    }

    fn insert<R: Record + ?Sized>(&mut self, records: &[&R]) -> RepoResult<u64> {
        let mut affected = 0;
        for record in records {
            let schema = record.schema();
            validate_schema(schema)?;
            let fields = record.to_fields();
            let columns: Vec<String> = fields.iter().map(|(name, _)| quote(name)).collect();
            let placeholders = vec!["?"; fields.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({});",
                quote(schema.table),
                columns.join(", "),
                placeholders
            );
            let changed = self
                .conn
                .execute(&sql, params_from_iter(fields.iter().map(|(_, value)| value)))?;
            affected += changed as u64;
        }
        Ok(affected)
    }

    fn update<R: Record + ?Sized>(
        &mut self,
        record: &R,
        columns: &[&str],
        filter: Option<&Filter>,
    ) -> RepoResult<u64> {
        let schema = record.schema();
        validate_schema(schema)?;
        let filter = non_empty(filter);
        let fields = record.to_fields();

        let assignments: Vec<&(&'static str, FieldValue)> = if !columns.is_empty() {
            for column in columns {
                if *column == schema.id_column {
                    return Err(RepoError::Validation(format!(
                        "id column `{column}` cannot be updated"
                    )));
                }
                if !schema.has_column(column) {
                    return Err(RepoError::Validation(format!(
                        "unknown column `{column}` for table `{}`",
                        schema.table
                    )));
                }
            }
            fields
                .iter()
                .filter(|(name, _)| columns.contains(name))
                .collect()
        } else if filter.is_some() {
            fields
                .iter()
                .filter(|(name, value)| *name != schema.id_column && !value.is_zero())
                .collect()
        } else {
            fields
                .iter()
                .filter(|(name, _)| *name != schema.id_column)
                .collect()
        };
        if assignments.is_empty() {
            return Err(RepoError::Validation(format!(
                "nothing to update in `{}`",
                schema.table
            )));
        }

        let mut params: Vec<FieldValue> = assignments.iter().map(|(_, value)| value.clone()).collect();
        let set_sql: Vec<String> = assignments
            .iter()
            .map(|(name, _)| format!("{} = ?", quote(name)))
            .collect();

        let mut conditions = Vec::new();
        let id = record.id();
        if id.is_set() {
            conditions.push(format!("{} = ?", quote(schema.id_column)));
            params.push(id.to_field());
        }
        if let Some(filter) = filter {
            conditions.push(format!("({})", filter.clause));
            params.extend(filter.params.iter().cloned());
        }
        if conditions.is_empty() {
            return Err(RepoError::Validation(format!(
                "update of `{}` needs an id or a condition",
                schema.table
            )));
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {};",
            quote(schema.table),
            set_sql.join(", "),
            conditions.join(" AND ")
        );
        let changed = self.conn.execute(&sql, params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn delete<R: Record + ?Sized>(
        &mut self,
        record: &R,
        filter: Option<&Filter>,
    ) -> RepoResult<u64> {
        let schema = record.schema();
        validate_schema(schema)?;

        let mut conditions = Vec::new();
        let mut params = Vec::new();
        let id = record.id();
        if id.is_set() {
            conditions.push(format!("{} = ?", quote(schema.id_column)));
            params.push(id.to_field());
        }
        if let Some(filter) = non_empty(filter) {
            conditions.push(format!("({})", filter.clause));
            params.extend(filter.params.iter().cloned());
        }
        if conditions.is_empty() {
            (conditions, params) = probe_conditions(&record.to_fields());
        }
        if conditions.is_empty() {
            return Err(RepoError::Validation(format!(
                "refusing unconditional delete on `{}`",
                schema.table
            )));
        }

        let sql = format!(
            "DELETE FROM {} WHERE {};",
            quote(schema.table),
            conditions.join(" AND ")
        );
        let changed = self.conn.execute(&sql, params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn exec(&mut self, clause: &str, params: &[FieldValue]) -> RepoResult<ExecResult> {
        if self.managed && TX_CONTROL_RE.is_match(clause) {
            return Err(RepoError::NestedTransaction);
        }
        let changed = self.conn.execute(clause, params_from_iter(params.iter()))?;
        Ok(ExecResult {
            rows_affected: changed as u64,
            last_insert_id: self.conn.last_insert_rowid(),
        })
    }

    fn query(&mut self, clause: &str, params: &[FieldValue]) -> RepoResult<Vec<RawRow>> {
        let mut stmt = self.conn.prepare(clause)?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut result = Vec::new();

        while let Some(row) = rows.next()? {
            let mut columns = Vec::with_capacity(names.len());
            for (index, name) in names.iter().enumerate() {
                let value = FieldValue::from_value_ref(row.get_ref(index)?)?;
                columns.push((name.clone(), value.to_raw_bytes()));
            }
            result.push(RawRow { columns });
        }

        Ok(result)
    }

    fn count<R: Record + ?Sized>(
        &mut self,
        record: &R,
        filter: Option<&Filter>,
    ) -> RepoResult<u64> {
        let schema = record.schema();
        validate_schema(schema)?;
        let (conditions, params) = match non_empty(filter) {
            Some(filter) => filter_conditions(filter),
            None => probe_conditions(&record.to_fields()),
        };

        let mut sql = format!("SELECT COUNT(*) FROM {}", quote(schema.table));
        push_where(&mut sql, &conditions);
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        u64::try_from(count)
            .map_err(|_| RepoError::InvalidData(format!("negative count {count}")))
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn is_managed(&self) -> bool {
        self.managed
    }

    fn set_managed(&mut self, managed: bool) {
        self.managed = managed;
    }

    fn begin(&mut self) -> RepoResult<()> {
        if self.in_transaction() || self.managed {
            return Err(RepoError::NestedTransaction);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(())
    }

    fn commit(&mut self) -> RepoResult<()> {
        if self.managed {
            return Err(RepoError::NestedTransaction);
        }
        if !self.in_transaction() {
            return Err(RepoError::NoActiveTransaction);
        }
        self.conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    fn rollback(&mut self) -> RepoResult<()> {
        if self.managed {
            return Err(RepoError::NestedTransaction);
        }
        if !self.in_transaction() {
            return Err(RepoError::NoActiveTransaction);
        }
        self.conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }

    fn close(mut self) -> RepoResult<()> {
        if self.in_transaction() {
            self.rollback()?;
        }
        self.conn.close().map_err(|(_, err)| err.into())
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn validate_identifier(identifier: &str) -> RepoResult<()> {
    if IDENTIFIER_RE.is_match(identifier) {
        Ok(())
    } else {
        Err(RepoError::Validation(format!(
            "invalid identifier `{identifier}`"
        )))
    }
}

fn validate_schema(schema: &RecordSchema) -> RepoResult<()> {
    validate_identifier(schema.table)?;
    for column in schema.columns {
        validate_identifier(column.name)?;
    }
    if !schema.has_column(schema.id_column) {
        return Err(RepoError::Validation(format!(
            "id column `{}` is not declared for `{}`",
            schema.id_column, schema.table
        )));
    }
    Ok(())
}

fn non_empty(filter: Option<&Filter>) -> Option<&Filter> {
    filter.filter(|filter| !filter.is_empty())
}

fn filter_conditions(filter: &Filter) -> (Vec<String>, Vec<FieldValue>) {
    (vec![format!("({})", filter.clause)], filter.params.clone())
}

/// Equality conditions from a record's non-zero fields.
fn probe_conditions(fields: &[(&'static str, FieldValue)]) -> (Vec<String>, Vec<FieldValue>) {
    fields
        .iter()
        .filter(|(_, value)| !value.is_zero())
        .map(|(name, value)| (format!("{} = ?", quote(name)), value.clone()))
        .unzip()
}

fn select_sql(schema: &RecordSchema, conditions: &[String]) -> String {
    let columns: Vec<String> = schema.columns.iter().map(|column| quote(column.name)).collect();
    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), quote(schema.table));
    push_where(&mut sql, conditions);
    sql
}

fn push_where(sql: &mut String, conditions: &[String]) {
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
}

fn push_order_by(sql: &mut String, order_by: Option<&str>) -> RepoResult<()> {
    let Some(order_by) = order_by.filter(|value| !value.trim().is_empty()) else {
        return Ok(());
    };
    if !ORDER_BY_RE.is_match(order_by) {
        return Err(RepoError::Validation(format!(
            "invalid order by clause `{order_by}`"
        )));
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(order_by.trim());
    Ok(())
}

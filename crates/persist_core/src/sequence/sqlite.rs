//! SQLite-backed `SequenceStore`.
//!
//! # Responsibility
//! - Persist counters in the `sequences` table.
//! - Advance them with the configured strategy.
//!
//! # Invariants
//! - `Native`: one `UPDATE ... RETURNING` statement; SQLite's write lock
//!   makes it atomic across connections and processes.
//! - `Table`: read, compute, compare-and-swap on `current_val`; a lost race
//!   is retried up to `conflict_retries` times, then reported as a conflict.

use crate::config::{PersistConfig, SequenceStrategy, DEFAULT_CONFLICT_RETRIES};
use crate::model::sequence::{SequenceRow, SEQUENCE_TABLE};
use crate::model::value::FieldValue;
use crate::repo::{
    Filter, GetQuery, RepositorySession, SessionFactory, SqliteSession, SqliteSessionFactory,
};
use crate::sequence::{SequenceError, SequenceResult, SequenceStore};
use log::{debug, warn};

pub struct SqliteSequenceStore {
    sessions: SqliteSessionFactory,
    strategy: SequenceStrategy,
    conflict_retries: u32,
}

impl SqliteSequenceStore {
    pub fn new(sessions: SqliteSessionFactory, config: &PersistConfig) -> Self {
        Self {
            sessions,
            strategy: config.sequence_strategy,
            conflict_retries: config.conflict_retries.max(1),
        }
    }

    pub fn with_strategy(sessions: SqliteSessionFactory, strategy: SequenceStrategy) -> Self {
        Self {
            sessions,
            strategy,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn strategy(&self) -> SequenceStrategy {
        self.strategy
    }

    /// Reads the stored counter row.
    pub fn row(&self, name: &str) -> SequenceResult<Option<SequenceRow>> {
        let mut session = self.sessions.open_session()?;
        let mut row = SequenceRow::default();
        let found = session.get(&mut row, &GetQuery::by(name_filter(name)))?;
        Ok(found.then_some(row))
    }

    fn fetch_native(&self, name: &str) -> SequenceResult<u64> {
        let mut session = self.sessions.open_session()?;
        let rows = session.query(
            &format!(
                "UPDATE {SEQUENCE_TABLE}
                 SET current_val = MAX(current_val + MAX(increment, 1), min_value)
                 WHERE name = ?1
                 RETURNING current_val;"
            ),
            &[FieldValue::from(name)],
        )?;

        let raw = rows
            .first()
            .and_then(|row| row.get_str("current_val"))
            .ok_or_else(|| SequenceError::NotFound(name.to_string()))?;
        raw.parse::<u64>().map_err(|err| {
            SequenceError::Store(format!("invalid current_val `{raw}` for `{name}`: {err}"))
        })
    }

    fn fetch_optimistic(&self, name: &str) -> SequenceResult<u64> {
        for attempt in 1..=self.conflict_retries {
            let mut session = self.sessions.open_session()?;
            match try_advance(&mut session, name)? {
                Advance::Missing => return Err(SequenceError::NotFound(name.to_string())),
                Advance::Advanced(high_water_mark) => return Ok(high_water_mark),
                Advance::Lost => {
                    warn!(
                        "event=seq_fetch module=sequence status=conflict name={name} attempt={attempt}"
                    );
                }
            }
        }

        Err(SequenceError::Conflict {
            name: name.to_string(),
            attempts: self.conflict_retries,
        })
    }
}

enum Advance {
    Missing,
    Advanced(u64),
    Lost,
}

fn try_advance(session: &mut SqliteSession, name: &str) -> SequenceResult<Advance> {
    let outcome = session.transaction(|tx| {
        let mut row = SequenceRow::default();
        let query = GetQuery {
            locked: true,
            ..GetQuery::by(name_filter(name))
        };
        if !tx.get(&mut row, &query)? {
            return Ok(Advance::Missing);
        }

        let expected = row.current_val;
        row.current_val = row.next_high_water_mark();
        let guard = Filter::new("current_val = ?", vec![FieldValue::Unsigned(expected)]);
        let changed = tx.update(&row, &["current_val"], Some(&guard))?;
        if changed == 0 {
            return Ok(Advance::Lost);
        }
        Ok(Advance::Advanced(row.current_val))
    })?;
    Ok(outcome)
}

fn name_filter(name: &str) -> Filter {
    Filter::new("name = ?", vec![FieldValue::from(name)])
}

impl SequenceStore for SqliteSequenceStore {
    fn create_if_missing(
        &self,
        name: &str,
        increment: u64,
        min_value: u64,
    ) -> SequenceResult<SequenceRow> {
        let mut session = self.sessions.open_session()?;
        let row = session.transaction(|tx| {
            let mut row = SequenceRow::default();
            if tx.get(&mut row, &GetQuery::by(name_filter(name)))? {
                return Ok(row);
            }

            let row = SequenceRow::new(name, increment, min_value);
            tx.insert(&[&row])?;
            debug!("event=seq_create module=sequence status=ok name={name} increment={increment}");
            Ok(row)
        })?;
        Ok(row)
    }

    fn fetch_next_block(&self, name: &str) -> SequenceResult<u64> {
        match self.strategy {
            SequenceStrategy::Native => self.fetch_native(name),
            SequenceStrategy::Table => self.fetch_optimistic(name),
        }
    }
}

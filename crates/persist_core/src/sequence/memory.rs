//! Process-local `SequenceStore`.
//!
//! Atomic by construction: every counter operation runs under one mutex.
//! Useful for tests and for single-process deployments without a database.

use crate::model::sequence::SequenceRow;
use crate::sequence::{SequenceError, SequenceResult, SequenceStore};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemorySequenceStore {
    rows: Mutex<BTreeMap<String, SequenceRow>>,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the stored counter row.
    pub fn row(&self, name: &str) -> SequenceResult<Option<SequenceRow>> {
        Ok(self.lock()?.get(name).cloned())
    }

    fn lock(&self) -> SequenceResult<std::sync::MutexGuard<'_, BTreeMap<String, SequenceRow>>> {
        self.rows
            .lock()
            .map_err(|_| SequenceError::Store("memory sequence store lock poisoned".to_string()))
    }
}

impl SequenceStore for MemorySequenceStore {
    fn create_if_missing(
        &self,
        name: &str,
        increment: u64,
        min_value: u64,
    ) -> SequenceResult<SequenceRow> {
        let mut rows = self.lock()?;
        let row = rows
            .entry(name.to_string())
            .or_insert_with(|| SequenceRow::new(name, increment, min_value));
        Ok(row.clone())
    }

    fn fetch_next_block(&self, name: &str) -> SequenceResult<u64> {
        let mut rows = self.lock()?;
        let row = rows
            .get_mut(name)
            .ok_or_else(|| SequenceError::NotFound(name.to_string()))?;
        row.current_val = row.next_high_water_mark();
        Ok(row.current_val)
    }
}

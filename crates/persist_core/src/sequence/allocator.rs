//! Block (hi-lo) identifier allocator.
//!
//! # Responsibility
//! - Cache unclaimed identifiers from the latest fetched block per sequence.
//! - Fetch further blocks from the `SequenceStore` only when the cache runs
//!   dry.
//!
//! # Invariants
//! - Each sequence's drain → fetch → distribute cycle runs under that
//!   sequence's mutex, so one allocator never issues a value twice.
//! - Values issued for one name strictly increase in issuance order.
//! - A failed `allocate` issues nothing and leaves every value it touched
//!   back in the cache.
//! - `0` is never issued; it means "no id".

use crate::config::{DEFAULT_INCREMENT, DEFAULT_MIN_VALUE};
use crate::sequence::{SequenceError, SequenceResult, SequenceStore};
use log::{debug, error, info};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

#[derive(Debug)]
struct SeqCache {
    increment: u64,
    min_value: u64,
    queue: VecDeque<u64>,
}

/// In-process identifier cache over a shared `SequenceStore`.
pub struct SequenceAllocator<S: SequenceStore> {
    store: S,
    default_increment: u64,
    default_min_value: u64,
    caches: RwLock<HashMap<String, Arc<Mutex<SeqCache>>>>,
}

impl<S: SequenceStore> SequenceAllocator<S> {
    pub fn new(store: S) -> Self {
        Self::with_defaults(store, DEFAULT_INCREMENT, DEFAULT_MIN_VALUE)
    }

    pub fn with_defaults(store: S, default_increment: u64, default_min_value: u64) -> Self {
        Self {
            store,
            default_increment: default_increment.max(1),
            default_min_value,
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Registers `name` with the default minimum value.
    pub fn register(&self, name: &str, increment: u64) -> SequenceResult<()> {
        self.register_with(name, increment, self.default_min_value)
    }

    /// Registers `name`, creating its counter row when missing.
    ///
    /// Idempotent: a known name keeps its cache untouched. When the row
    /// already exists its stored increment and minimum win over the
    /// arguments, since other processes size their blocks from it too.
    pub fn register_with(&self, name: &str, increment: u64, min_value: u64) -> SequenceResult<()> {
        let name = normalize_name(name)?;
        if self.read_caches()?.contains_key(name) {
            return Ok(());
        }

        let increment = if increment == 0 {
            self.default_increment
        } else {
            increment
        };
        let row = self.store.create_if_missing(name, increment, min_value)?;

        let mut caches = self.write_caches()?;
        caches.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(SeqCache {
                increment: row.increment.max(1),
                min_value: row.min_value,
                queue: VecDeque::new(),
            }))
        });
        info!(
            "event=seq_register module=sequence status=ok name={} increment={} min_value={}",
            name, row.increment, row.min_value
        );
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.read_caches()
            .map(|caches| caches.contains_key(name))
            .unwrap_or(false)
    }

    /// Number of unclaimed identifiers cached for `name`.
    pub fn cached_len(&self, name: &str) -> SequenceResult<usize> {
        let cache = self.cache_for(name)?;
        let guard = lock_cache(&cache, name)?;
        Ok(guard.queue.len())
    }

    pub fn next_id(&self, name: &str) -> SequenceResult<u64> {
        let ids = self.allocate(name, 1)?;
        ids.first()
            .copied()
            .ok_or_else(|| SequenceError::Store(format!("no id allocated for `{name}`")))
    }

    /// Returns `count` fresh identifiers for `name`, ascending.
    ///
    /// # Errors
    /// - `InvalidCount` when `count == 0`.
    /// - `UnregisteredSequence` when `name` was never registered.
    /// - Any store failure while fetching a block; the cache then holds every
    ///   value this call had taken.
    pub fn allocate(&self, name: &str, count: usize) -> SequenceResult<Vec<u64>> {
        if count == 0 {
            return Err(SequenceError::InvalidCount(count));
        }
        let started_at = Instant::now();
        let cache = self.cache_for(name)?;
        let mut guard = lock_cache(&cache, name)?;
        let seq = &mut *guard;

        let drained = count.min(seq.queue.len());
        let mut ids: Vec<u64> = seq.queue.drain(..drained).collect();
        if ids.len() == count {
            debug!(
                "event=seq_allocate module=sequence status=ok name={name} count={count} source=cache"
            );
            return Ok(ids);
        }

        let remaining = (count - ids.len()) as u64;
        let planned_blocks = remaining.div_ceil(seq.increment);
        let mut fetched_blocks = 0u64;

        while ids.len() < count {
            let block = match self.fetch_block(name, seq) {
                Ok(block) => block,
                Err(err) => {
                    error!(
                        "event=seq_allocate module=sequence status=error name={} count={} fetched_blocks={} error={}",
                        name, count, fetched_blocks, err
                    );
                    // Nothing taken in this call has been issued yet.
                    for id in ids.into_iter().rev() {
                        seq.queue.push_front(id);
                    }
                    return Err(err);
                }
            };
            fetched_blocks += 1;

            for id in block.0..=block.1 {
                if ids.len() < count {
                    ids.push(id);
                } else {
                    seq.queue.push_back(id);
                }
            }
        }

        info!(
            "event=seq_allocate module=sequence status=ok name={} count={} planned_blocks={} fetched_blocks={} cached={} duration_ms={}",
            name,
            count,
            planned_blocks,
            fetched_blocks,
            seq.queue.len(),
            started_at.elapsed().as_millis()
        );
        Ok(ids)
    }

    /// Fetches one block and returns its inclusive usable range.
    fn fetch_block(&self, name: &str, seq: &SeqCache) -> SequenceResult<(u64, u64)> {
        let high_water_mark = self.store.fetch_next_block(name)?;
        let start = high_water_mark
            .saturating_sub(seq.increment - 1)
            .max(seq.min_value)
            .max(1);
        if start > high_water_mark {
            return Err(SequenceError::EmptyBlock {
                name: name.to_string(),
                high_water_mark,
            });
        }
        debug!(
            "event=seq_fetch module=sequence status=ok name={name} start={start} end={high_water_mark}"
        );
        Ok((start, high_water_mark))
    }

    fn cache_for(&self, name: &str) -> SequenceResult<Arc<Mutex<SeqCache>>> {
        self.read_caches()?
            .get(name)
            .cloned()
            .ok_or_else(|| SequenceError::UnregisteredSequence(name.to_string()))
    }

    fn read_caches(
        &self,
    ) -> SequenceResult<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<SeqCache>>>>>
    {
        self.caches
            .read()
            .map_err(|_| SequenceError::Store("sequence cache registry poisoned".to_string()))
    }

    fn write_caches(
        &self,
    ) -> SequenceResult<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<SeqCache>>>>>
    {
        self.caches
            .write()
            .map_err(|_| SequenceError::Store("sequence cache registry poisoned".to_string()))
    }
}

fn lock_cache<'a>(cache: &'a Mutex<SeqCache>, name: &str) -> SequenceResult<MutexGuard<'a, SeqCache>> {
    cache
        .lock()
        .map_err(|_| SequenceError::Store(format!("sequence cache `{name}` poisoned")))
}

fn normalize_name(name: &str) -> SequenceResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed != name {
        return Err(SequenceError::InvalidName(name.to_string()));
    }
    Ok(trimmed)
}

use persist_core::model::sequence::SequenceRow;
use persist_core::sequence::{
    MemorySequenceStore, SequenceAllocator, SequenceError, SequenceResult, SequenceStore,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Memory store whose fetches can be switched off.
#[derive(Default)]
struct FlakyStore {
    inner: MemorySequenceStore,
    failing: AtomicBool,
    fetches: AtomicUsize,
}

impl SequenceStore for FlakyStore {
    fn create_if_missing(
        &self,
        name: &str,
        increment: u64,
        min_value: u64,
    ) -> SequenceResult<SequenceRow> {
        self.inner.create_if_missing(name, increment, min_value)
    }

    fn fetch_next_block(&self, name: &str) -> SequenceResult<u64> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SequenceError::Store("store unavailable".to_string()));
        }
        self.inner.fetch_next_block(name)
    }
}

#[test]
fn first_allocation_fetches_one_block_and_caches_the_rest() {
    let allocator = SequenceAllocator::new(MemorySequenceStore::new());
    allocator.register("seq_base", 500).unwrap();

    let ids = allocator.allocate("seq_base", 3).unwrap();

    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(allocator.cached_len("seq_base").unwrap(), 497);
    assert_eq!(
        allocator.store().row("seq_base").unwrap().unwrap().current_val,
        500
    );
    assert_eq!(allocator.allocate("seq_base", 2).unwrap(), vec![4, 5]);
}

#[test]
fn register_is_idempotent_and_keeps_cache() {
    let store = Arc::new(FlakyStore::default());
    let allocator = SequenceAllocator::new(Arc::clone(&store));
    allocator.register("seq_base", 500).unwrap();
    allocator.allocate("seq_base", 1).unwrap();

    allocator.register("seq_base", 500).unwrap();
    allocator.register("seq_base", 20).unwrap();

    assert_eq!(allocator.cached_len("seq_base").unwrap(), 499);
    assert_eq!(allocator.allocate("seq_base", 1).unwrap(), vec![2]);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn register_adopts_increment_of_existing_row() {
    let store = Arc::new(MemorySequenceStore::new());
    store.create_if_missing("seq_shared", 10, 1).unwrap();

    let allocator = SequenceAllocator::new(Arc::clone(&store));
    allocator.register("seq_shared", 500).unwrap();

    assert_eq!(allocator.allocate("seq_shared", 1).unwrap(), vec![1]);
    assert_eq!(allocator.cached_len("seq_shared").unwrap(), 9);
}

#[test]
fn large_requests_span_several_blocks_in_order() {
    let allocator = SequenceAllocator::new(MemorySequenceStore::new());
    allocator.register("seq_small", 4).unwrap();

    let ids = allocator.allocate("seq_small", 10).unwrap();

    assert_eq!(ids, (1..=10).collect::<Vec<u64>>());
    assert_eq!(allocator.cached_len("seq_small").unwrap(), 2);
    assert_eq!(
        allocator.store().row("seq_small").unwrap().unwrap().current_val,
        12
    );
}

#[test]
fn later_calls_return_strictly_greater_ids() {
    let allocator = SequenceAllocator::new(MemorySequenceStore::new());
    allocator.register("seq_mono", 7).unwrap();

    let mut last = 0;
    for count in [1, 5, 3, 9, 2, 14] {
        let ids = allocator.allocate("seq_mono", count).unwrap();
        assert_eq!(ids.len(), count);
        for id in ids {
            assert!(id > last, "id {id} not greater than {last}");
            last = id;
        }
    }
}

#[test]
fn concurrent_callers_never_share_an_id() {
    let allocator = Arc::new(SequenceAllocator::new(MemorySequenceStore::new()));
    allocator.register("seq_race", 16).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                let mut taken = Vec::new();
                for round in 0..50 {
                    let count = 1 + (worker + round) % 5;
                    let ids = allocator.allocate("seq_race", count).unwrap();
                    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
                    taken.extend(ids);
                }
                taken
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().unwrap() {
            total += 1;
            assert!(seen.insert(id), "id {id} issued twice");
        }
    }
    assert_eq!(seen.len(), total);
}

#[test]
fn failed_fetch_issues_nothing_and_restores_cache() {
    let store = Arc::new(FlakyStore::default());
    let allocator = SequenceAllocator::new(Arc::clone(&store));
    allocator.register("seq_flaky", 5).unwrap();
    allocator.allocate("seq_flaky", 2).unwrap();
    assert_eq!(allocator.cached_len("seq_flaky").unwrap(), 3);

    store.failing.store(true, Ordering::SeqCst);
    let err = allocator.allocate("seq_flaky", 6).unwrap_err();
    assert!(matches!(err, SequenceError::Store(_)));
    assert_eq!(allocator.cached_len("seq_flaky").unwrap(), 3);

    store.failing.store(false, Ordering::SeqCst);
    assert_eq!(
        allocator.allocate("seq_flaky", 6).unwrap(),
        vec![3, 4, 5, 6, 7, 8]
    );
}

#[test]
fn invalid_requests_are_rejected_before_any_fetch() {
    let store = Arc::new(FlakyStore::default());
    let allocator = SequenceAllocator::new(Arc::clone(&store));

    assert!(matches!(
        allocator.allocate("seq_missing", 1),
        Err(SequenceError::UnregisteredSequence(name)) if name == "seq_missing"
    ));

    allocator.register("seq_base", 500).unwrap();
    assert!(matches!(
        allocator.allocate("seq_base", 0),
        Err(SequenceError::InvalidCount(0))
    ));
    assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
}

#[test]
fn next_id_walks_the_cache() {
    let allocator = SequenceAllocator::new(MemorySequenceStore::new());
    allocator.register("seq_one", 2).unwrap();

    let ids: Vec<u64> = (0..5).map(|_| allocator.next_id("seq_one").unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

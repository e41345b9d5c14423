#![allow(dead_code)]

use std::sync::Arc;

use heapmeta::{DlHeap, HeapIndex, IndexConfig, RangeRegistry};

/// Plenty for any one test, and only touched pages are ever backed
pub const TEST_RESERVE: usize = 256 << 20;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn index_with(config: IndexConfig) -> (Arc<RangeRegistry>, HeapIndex<DlHeap>) {
    init_logging();
    let registry = Arc::new(RangeRegistry::new());
    let heap = DlHeap::with_reserve(registry.clone(), TEST_RESERVE);
    let index = HeapIndex::new(heap, registry.clone(), config);
    (registry, index)
}

pub fn index() -> (Arc<RangeRegistry>, HeapIndex<DlHeap>) {
    index_with(IndexConfig::default())
}

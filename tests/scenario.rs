mod common;

use heapmeta::{AllocatorKind, BigAllocRegistry, IndexConfig, IndexError, SiteOrType};

#[test]
fn small_big_free_and_type() {
    let (registry, index) = common::index();
    assert!(!index.is_functional());

    let small = unsafe { index.malloc(16, 8) } as usize;
    assert!(index.is_functional());
    let info = index.get_info(small).unwrap();
    assert_eq!(info.base, small);
    assert!(info.size >= 16);
    assert!(!info.promoted);

    let big = unsafe { index.malloc(200_000, 8) } as usize;
    let info = index.get_info(big + 199_999).unwrap();
    assert_eq!(info.base, big);
    assert!(info.size >= 200_000);
    assert!(info.promoted);
    assert!(registry
        .ranges()
        .iter()
        .any(|range| range.begin() == big && range.allocated_by() == AllocatorKind::GenericMalloc));

    unsafe { index.free(small as *mut u8) };
    assert_eq!(
        index.get_info(small),
        Err(IndexError::UnindexedHeapObject { addr: small })
    );

    index.set_type(big, 0xfeed_f00d).unwrap();
    let info = index.get_info(big + 1234).unwrap();
    assert!(info.origin.is_type());
    assert_eq!(info.origin, SiteOrType::Type(0xfeed_f00d));

    unsafe { index.free(big as *mut u8) };
    assert!(index.get_info(big).is_err());
    assert!(!registry
        .ranges()
        .iter()
        .any(|range| range.allocated_by() == AllocatorKind::GenericMalloc));
}

#[test]
fn promotion_threshold_is_strict() {
    let (registry, index) =
        common::index_with(IndexConfig::default().with_promotion_threshold(4096));

    let at = unsafe { index.malloc(4096, 8) } as usize;
    let above = unsafe { index.malloc(4097, 8) } as usize;

    let at_info = index.get_info(at).unwrap();
    assert!(!at_info.promoted);
    assert!(at_info.size >= 4096);
    let arena = registry.find_deepest_range(at).unwrap();
    assert_eq!(arena.suballocator(), Some(AllocatorKind::GenericMalloc));
    assert!(registry
        .find_owning_range_under(at, AllocatorKind::GenericMalloc, &arena)
        .is_none());

    let above_info = index.get_info(above + 4096).unwrap();
    assert!(above_info.promoted);
    assert_eq!(above_info.base, above);

    // Nothing in the bitmap claims the promoted chunk
    let snapshot = index.snapshot();
    let bitmap_bases: Vec<usize> = snapshot
        .arenas
        .iter()
        .flat_map(|arena| arena.chunks.iter().map(|chunk| chunk.base))
        .collect();
    assert!(bitmap_bases.contains(&at));
    assert!(!bitmap_bases.contains(&above));
    assert!(snapshot.promoted.iter().any(|chunk| chunk.base == above));
}

#[test]
fn addresses_outside_every_arena_are_unindexed() {
    let (_registry, index) = common::index();
    let on_stack = 0u64;
    let addr = &on_stack as *const u64 as usize;
    assert_eq!(
        index.get_info(addr),
        Err(IndexError::UnindexedHeapObject { addr })
    );
    assert!(index.set_type(addr, 1).is_err());
}

#[test]
fn ensure_big_moves_a_chunk_out_of_the_bitmap() {
    let (_registry, index) = common::index();
    let chunk = unsafe { index.malloc(100, 8) } as usize;
    let before = index.get_info(chunk + 50).unwrap();
    assert!(!before.promoted);

    let record = index.ensure_big(chunk + 50, 100).unwrap();
    assert_eq!(record.begin(), chunk);
    assert_eq!(record.size(), before.size);

    let after = index.get_info(chunk + 50).unwrap();
    assert!(after.promoted);
    assert_eq!(
        (after.base, after.size, after.origin),
        (before.base, before.size, before.origin)
    );
    assert!(index.snapshot().arenas[0].chunks.iter().all(|info| info.base != chunk));

    // Asking again hands back the same record
    let again = index.ensure_big(chunk, 100).unwrap();
    assert!(std::sync::Arc::ptr_eq(&record, &again));

    unsafe { index.free(chunk as *mut u8) };
    assert!(index.get_info(chunk).is_err());
}

#[test]
fn snapshot_serializes_to_json() {
    let (_registry, index) = common::index();
    let a = unsafe { index.malloc(40, 8) } as usize;
    let b = unsafe { index.malloc(300_000, 8) } as usize;
    let snapshot = index.snapshot();
    assert_eq!(snapshot.chunks().count(), 2);
    assert_eq!(snapshot.stats.inserts, 2);
    assert!(snapshot.biggest_allocated >= 300_000);
    assert!(snapshot.biggest_unpromoted >= 40 && snapshot.biggest_unpromoted < 300_000);

    let json = snapshot.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["promoted"][0]["base"], b);
    assert_eq!(value["arenas"][0]["chunks"][0]["base"], a);
}

//! Allocate, reallocate, free and look up from many threads at once. Lookups
//! never take the index lock, so this is where a race between the read path
//! and bitmap growth or bit updates would show.

mod common;

use std::{sync::Arc, thread};

use heapmeta::{thread_println, IndexConfig};
use rand::{rngs::StdRng, Rng, SeedableRng};

const THREADS: usize = 8;
const ROUNDS: usize = 3000;

#[test]
fn parallel_alloc_free_lookup() {
    let config = IndexConfig::default().with_promotion_threshold(16 << 10);
    let (_registry, index) = common::index_with(config);
    let index = Arc::new(index);

    let handles: Vec<_> = (0..THREADS)
        .map(|n| {
            let index = Arc::clone(&index);
            thread::Builder::new()
                .name(format!("stress-{n}"))
                .spawn(move || {
                    let mut rng = StdRng::seed_from_u64(n as u64);
                    let mut live: Vec<(*mut u8, usize)> = Vec::new();
                    for _ in 0..ROUNDS {
                        match rng.gen_range(0..10) {
                            0..=3 => {
                                let size = if rng.gen_bool(0.05) {
                                    rng.gen_range(20_000..80_000)
                                } else {
                                    rng.gen_range(1..1024)
                                };
                                let ptr = unsafe { index.malloc(size, 8) };
                                assert!(!ptr.is_null());
                                unsafe { ptr.write_bytes(n as u8, size) };
                                live.push((ptr, size));
                            }
                            4..=5 if !live.is_empty() => {
                                let (ptr, _) = live.swap_remove(rng.gen_range(0..live.len()));
                                unsafe { index.free(ptr) };
                            }
                            6 if !live.is_empty() => {
                                let slot = rng.gen_range(0..live.len());
                                let (ptr, size) = live[slot];
                                let new_size = if rng.gen_bool(0.05) {
                                    rng.gen_range(20_000..80_000)
                                } else {
                                    rng.gen_range(1..2048)
                                };
                                let new = unsafe { index.realloc(ptr, 8, new_size) };
                                assert!(!new.is_null());
                                let kept = size.min(new_size);
                                assert_eq!(unsafe { new.add(kept - 1).read() }, n as u8);
                                unsafe { new.write_bytes(n as u8, new_size) };
                                let info = index.lookup(new as usize + new_size - 1).unwrap();
                                assert_eq!(info.base, new as usize);
                                live[slot] = (new, new_size);
                            }
                            _ if !live.is_empty() => {
                                let (ptr, size) = live[rng.gen_range(0..live.len())];
                                let offset = rng.gen_range(0..size);
                                let info = index.lookup(ptr as usize + offset).unwrap();
                                assert_eq!(info.base, ptr as usize);
                                assert!(info.size >= size);
                                assert_eq!(unsafe { ptr.add(offset).read() }, n as u8);
                            }
                            _ => {}
                        }
                    }
                    thread_println!("{} chunks still live", live.len());
                    live.into_iter().map(|(ptr, size)| (ptr as usize, size)).collect::<Vec<_>>()
                })
                .unwrap()
        })
        .collect();

    let mut survivors: Vec<(usize, usize)> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    survivors.sort_unstable();
    for &(base, size) in &survivors {
        assert_eq!(index.lookup(base).unwrap().base, base);
        assert_eq!(index.lookup(base + size - 1).unwrap().base, base);
    }

    let snapshot = index.snapshot();
    let mut indexed: Vec<(usize, usize)> = snapshot
        .chunks()
        .map(|info| (info.base, info.size))
        .collect();
    indexed.sort_unstable();
    assert_eq!(indexed.len(), survivors.len());
    for (&(base, size), &(indexed_base, indexed_size)) in survivors.iter().zip(&indexed) {
        assert_eq!(base, indexed_base);
        assert!(indexed_size >= size);
    }
    assert_eq!(
        snapshot.stats.inserts - snapshot.stats.deletes,
        survivors.len() as u64
    );
}

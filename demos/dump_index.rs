//! Allocate a few objects through a dlmalloc heap fronted by the index, then
//! print what the index knows as JSON.
//!
//! `RUST_LOG=heapmeta=trace cargo run --example dump_index`

use std::sync::Arc;

use heapmeta::{alloc::context, DlHeap, HeapIndex, IndexConfig, RangeRegistry};

fn main() {
    env_logger::init();

    let registry = Arc::new(RangeRegistry::new());
    let heap = DlHeap::new(registry.clone());
    let index = HeapIndex::new(heap, registry, IndexConfig::from_env());

    let small = unsafe { index.malloc(24, 8) };
    context::tag_next_allocation(0x1000, 0);
    let tagged = unsafe { index.malloc(512, 16) };
    let big = unsafe { index.malloc(1 << 20, 8) };
    index.set_type(big as usize + 100, 0xdead_beef).ok();

    for (name, ptr) in [("small", small), ("tagged", tagged), ("big", big)] {
        match index.get_info(ptr as usize + 1) {
            Ok(info) => println!("{name}: {info:?}"),
            Err(err) => println!("{name}: {err}"),
        }
    }

    match index.snapshot().to_json() {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("could not serialize snapshot: {err}"),
    }
}

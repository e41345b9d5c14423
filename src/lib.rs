//! A shadow index over a general-purpose heap: given any address inside a
//! live heap chunk, find the chunk's start, its caller-visible size and where
//! it was allocated (or what type it was later asserted to have).
//!
//! Small chunks are recorded as one bit per 16-byte slot in a per-arena
//! bitmap and found by scanning backward from the queried address. Chunks
//! above the promotion threshold are registered as ranges in a
//! [`BigAllocRegistry`](alloc::registry::BigAllocRegistry) instead. Each
//! chunk carries a [`ChunkTrailer`](alloc::meta::ChunkTrailer) right after
//! its caller-visible bytes.
//!
//! The host allocator either calls the [`HeapIndex`] hooks itself (see
//! [`externc`] for the C ABI) or is driven by [`HeapIndex::malloc()`] and
//! friends.

pub mod alloc;
pub mod config;
pub mod error;
pub mod externc;
pub mod os;
pub mod util;

pub use crate::alloc::{
    descriptor::AllocatorDescriptor,
    dlmalloc::DlHeap,
    host::HostAllocator,
    index::{HeapIndex, IndexObserver},
    lookup::ChunkInfo,
    meta::SiteOrType,
    registry::{AllocatorKind, BigAlloc, BigAllocRegistry, RangeRegistry},
};
pub use config::IndexConfig;
pub use error::{IndexError, RegistryError};

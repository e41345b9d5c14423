//! The face the index shows to generic introspection code, which deals with
//! many allocators at once and only knows them through this trait.

use super::{
    host::HostAllocator,
    index::HeapIndex,
    lookup::ChunkInfo,
    meta::ChunkTrailer,
    registry::{AllocatorKind, BigAlloc},
};
use crate::error::IndexError;

pub trait AllocatorDescriptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Describe the object containing `addr`. `maybe_big` is a registry
    /// record the caller already found there, if any.
    fn get_info(&self, addr: usize, maybe_big: Option<&BigAlloc>) -> Result<ChunkInfo, IndexError>;

    fn set_type(&self, addr: usize, ty: usize) -> Result<(), IndexError>;

    /// Make sure the object at `addr` has a registry record of its own.
    fn ensure_big(&self, addr: usize, size: usize) -> Result<BigAlloc, IndexError>;

    /// May callers cache answers? Entries don't change between insert and
    /// delete, and deletes are announced through the index observer.
    fn is_cacheable(&self) -> bool {
        true
    }

    /// Free the object at `ptr` through this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` is a live object start from this allocator.
    unsafe fn free(&self, ptr: *mut u8);
}

impl<H: HostAllocator> AllocatorDescriptor for HeapIndex<H> {
    fn name(&self) -> &'static str {
        "generic malloc"
    }

    fn get_info(&self, addr: usize, maybe_big: Option<&BigAlloc>) -> Result<ChunkInfo, IndexError> {
        match maybe_big {
            Some(record)
                if record.allocated_by() == AllocatorKind::GenericMalloc && record.contains(addr) =>
            {
                let (base, size) = (record.begin(), record.size());
                // SAFETY: a live promotion record spans a live chunk's caller
                //         bytes, the trailer follows them
                let origin = unsafe { ChunkTrailer::at(base + size) }.read();
                Ok(ChunkInfo {
                    base,
                    size,
                    origin,
                    promoted: true,
                })
            }
            _ => HeapIndex::get_info(self, addr),
        }
    }

    fn set_type(&self, addr: usize, ty: usize) -> Result<(), IndexError> {
        HeapIndex::set_type(self, addr, ty)
    }

    fn ensure_big(&self, addr: usize, size: usize) -> Result<BigAlloc, IndexError> {
        HeapIndex::ensure_big(self, addr, size)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        HeapIndex::free(self, ptr)
    }
}

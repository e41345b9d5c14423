//! [`DlHeap`]: a host allocator built on the `dlmalloc` crate.
//!
//! dlmalloc gets its segments from one big `MAP_NORESERVE` reservation,
//! handed out lowest address first, so the heap is a single contiguous arena
//! that only grows at the end. The first segment registers the arena with the
//! registry; every later one extends it.
//!
//! dlmalloc has no public usable-size query, so each chunk carries a small
//! header in front of the pointer we hand out:
//!
//! ```plaintext
//! raw (from dlmalloc)      ptr (handed out, what the index sees)
//! |                        |
//! +--------------+---------+------------------------+
//! | align pad    | header  | size bytes             |
//! +--------------+---------+------------------------+
//! ```

use std::{
    cmp,
    mem,
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use dlmalloc::{Allocator, Dlmalloc};
use once_cell::{sync::OnceCell as SyncOnceCell, unsync::OnceCell};

use super::{
    host::HostAllocator,
    registry::{AllocatorKind, BigAlloc, BigAllocRegistry},
};
use crate::os::mem::{MmapRegion, PageBump, PAGE_SIZE};

/// Address space reserved for the heap up front. Only touched pages cost
/// anything.
pub const DEFAULT_RESERVE: usize = 1 << 30;

#[repr(C)]
struct ChunkHeader {
    /// `ptr - raw`
    offset: AtomicUsize,
    /// Bytes the caller asked for
    size: AtomicUsize,
}

const HEADER_SIZE: usize = mem::size_of::<ChunkHeader>();

impl ChunkHeader {
    /// # Safety
    ///
    /// `ptr` was handed out by a [`DlHeap`] and is live.
    unsafe fn of<'a>(ptr: *const u8) -> &'a Self {
        &*(ptr.sub(HEADER_SIZE) as *const Self)
    }
}

/// Segment source for dlmalloc. Lives inside the heap's mutex, so unsynced
/// cells are enough for its own state.
struct SegmentSource {
    registry: Arc<dyn BigAllocRegistry>,
    reserve: usize,
    pages: OnceCell<PageBump>,
    /// Shared with the [`DlHeap`] so it can be read without the mutex
    arena: Arc<SyncOnceCell<BigAlloc>>,
}

impl SegmentSource {
    fn pages(&self) -> Option<&PageBump> {
        self.pages
            .get_or_try_init(|| MmapRegion::map_noreserve(self.reserve).map(PageBump::new).ok_or(()))
            .ok()
    }

    /// Make the registry's idea of the arena match what we've handed out.
    fn publish(&self, pages: &PageBump) -> bool {
        if let Some(arena) = self.arena.get() {
            self.registry.extend_range_end(arena, pages.end());
            return true;
        }
        match self.registry.create_range(
            pages.begin(),
            pages.end() - pages.begin(),
            None,
            None,
            AllocatorKind::Mapping,
            Some(AllocatorKind::GenericMalloc),
        ) {
            Ok(arena) => {
                log::debug!("heap arena at {:#x}", arena.begin());
                _ = self.arena.set(arena);
                true
            }
            Err(err) => {
                log::error!("could not register heap arena: {err}");
                false
            }
        }
    }
}

// SAFETY: dlmalloc calls back into this only with the heap mutex held
unsafe impl Allocator for SegmentSource {
    fn alloc(&self, size: usize) -> (*mut u8, usize, u32) {
        let Some(pages) = self.pages() else {
            return (ptr::null_mut(), 0, 0);
        };
        match pages.take(size) {
            Some((segment, size)) if self.publish(pages) => (segment, size, 0),
            _ => (ptr::null_mut(), 0, 0),
        }
    }

    fn remap(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize, _can_move: bool) -> *mut u8 {
        ptr::null_mut()
    }

    fn free_part(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize) -> bool {
        false
    }

    fn free(&self, _ptr: *mut u8, _size: usize) -> bool {
        false
    }

    fn can_release_part(&self, _flags: u32) -> bool {
        false
    }

    fn allocates_zeros(&self) -> bool {
        true
    }

    fn page_size(&self) -> usize {
        *PAGE_SIZE
    }
}

struct LockedDlmalloc(Dlmalloc<SegmentSource>);

// SAFETY: only ever used through the `Mutex` in `DlHeap`
unsafe impl Send for LockedDlmalloc {}

/// A thread-safe dlmalloc heap whose memory is registered as an arena.
pub struct DlHeap {
    heap: Mutex<LockedDlmalloc>,
    arena: Arc<SyncOnceCell<BigAlloc>>,
}

impl DlHeap {
    pub fn new(registry: Arc<dyn BigAllocRegistry>) -> Self {
        Self::with_reserve(registry, DEFAULT_RESERVE)
    }

    /// A heap that can never grow past `reserve` bytes.
    pub fn with_reserve(registry: Arc<dyn BigAllocRegistry>, reserve: usize) -> Self {
        let arena = Arc::new(SyncOnceCell::new());
        let source = SegmentSource {
            registry,
            reserve,
            pages: OnceCell::new(),
            arena: Arc::clone(&arena),
        };
        Self {
            heap: Mutex::new(LockedDlmalloc(Dlmalloc::new_with_allocator(source))),
            arena,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LockedDlmalloc> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The arena backing this heap, once anything has been allocated.
    pub fn arena(&self) -> Option<BigAlloc> {
        self.arena.get().cloned()
    }
}

fn offset_for(align: usize) -> usize {
    cmp::max(align, HEADER_SIZE)
}

// SAFETY: pointers are `offset_for(align)` past a dlmalloc chunk aligned to
// at least 16, inside a region registered as an arena before dlmalloc saw
// it. The header records exactly what was asked for.
unsafe impl HostAllocator for DlHeap {
    unsafe fn malloc(&self, size: usize, align: usize) -> *mut u8 {
        let offset = offset_for(align);
        let Some(total) = size.checked_add(offset) else {
            return ptr::null_mut();
        };
        let raw = self.lock().0.malloc(total, offset);
        if raw.is_null() {
            return raw;
        }
        let ptr = raw.add(offset);
        let header = ChunkHeader::of(ptr);
        header.offset.store(offset, Ordering::Relaxed);
        header.size.store(size, Ordering::Release);
        ptr
    }

    unsafe fn free(&self, ptr: *mut u8) {
        let header = ChunkHeader::of(ptr);
        let offset = header.offset.load(Ordering::Relaxed);
        let size = header.size.load(Ordering::Relaxed);
        self.lock().0.free(ptr.sub(offset), size + offset, offset);
    }

    unsafe fn realloc(&self, ptr: *mut u8, align: usize, new_size: usize) -> *mut u8 {
        let header = ChunkHeader::of(ptr);
        let offset = header.offset.load(Ordering::Relaxed);
        let old_size = header.size.load(Ordering::Relaxed);
        let Some(total) = new_size.checked_add(offset) else {
            return ptr::null_mut();
        };

        if offset != HEADER_SIZE || offset_for(align) != HEADER_SIZE {
            // Over-aligned: dlmalloc can't keep our padding, move by hand
            let new = self.malloc(new_size, align);
            if !new.is_null() {
                ptr::copy_nonoverlapping(ptr, new, cmp::min(old_size, new_size));
                self.free(ptr);
            }
            return new;
        }

        let raw = self
            .lock()
            .0
            .realloc(ptr.sub(offset), old_size + offset, offset, total);
        if raw.is_null() {
            return raw;
        }
        let new = raw.add(offset);
        // dlmalloc copied the header along with the data
        ChunkHeader::of(new).size.store(new_size, Ordering::Release);
        new
    }

    unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        ChunkHeader::of(ptr).size.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::registry::RangeRegistry;

    #[test]
    fn chunks_land_in_one_growing_arena() {
        let registry = Arc::new(RangeRegistry::new());
        let heap = DlHeap::with_reserve(registry.clone(), 64 << 20);
        assert!(heap.arena().is_none());

        let small = unsafe { heap.malloc(24, 8) };
        assert!(!small.is_null());
        assert_eq!(small as usize % 16, 0);
        let arena = heap.arena().unwrap();
        assert!(arena.contains(small as usize));
        assert_eq!(arena.suballocator(), Some(AllocatorKind::GenericMalloc));

        let big = unsafe { heap.malloc(8 << 20, 64) };
        assert!(!big.is_null());
        assert_eq!(big as usize % 64, 0);
        assert!(arena.contains(big as usize + (8 << 20) - 1));
        assert_eq!(registry.len(), 1);

        unsafe {
            assert_eq!(heap.usable_size(small), 24);
            assert_eq!(heap.usable_size(big), 8 << 20);
            heap.free(small);
            heap.free(big);
        }
    }

    #[test]
    fn realloc_keeps_contents() {
        let registry = Arc::new(RangeRegistry::new());
        let heap = DlHeap::with_reserve(registry, 16 << 20);
        unsafe {
            let ptr = heap.malloc(16, 16);
            ptr.copy_from_nonoverlapping(b"0123456789abcdef".as_ptr(), 16);
            let grown = heap.realloc(ptr, 16, 4096);
            assert_eq!(heap.usable_size(grown), 4096);
            assert_eq!(std::slice::from_raw_parts(grown, 16), b"0123456789abcdef");

            let aligned = heap.malloc(16, 256);
            aligned.write(7);
            let moved = heap.realloc(aligned, 256, 1024);
            assert_eq!(moved as usize % 256, 0);
            assert_eq!(moved.read(), 7);
            heap.free(grown);
            heap.free(moved);
        }
    }
}

//! The host allocator boundary, and the wrapper that drives the index hooks
//! around it.
//!
//! A host that already calls the hooks itself (a C malloc instrumented with
//! [`crate::externc`]) only needs [`HostAllocator::usable_size()`]. A host
//! that doesn't can be driven through [`HeapIndex::malloc()`] and friends,
//! which call the hooks in the right order and take care of reentrancy.

use std::{panic::Location, ptr};

use super::{
    context::{self, ReentrancyGuard},
    index::HeapIndex,
};

/// A heap the index can sit in front of.
///
/// # Safety
///
/// Chunks must be [`SLOT_SIZE`](super::bitvec::SLOT_SIZE)-aligned, lie inside
/// a range registered as an arena before they are returned, and stay put
/// until freed. `usable_size()` must report at least the size that was asked
/// for and must not change while the chunk is live.
pub unsafe trait HostAllocator: Send + Sync {
    /// `size` bytes aligned to `align`, null on failure.
    ///
    /// # Safety
    ///
    /// `align` is a power of two.
    unsafe fn malloc(&self, size: usize, align: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` came from this host and is live.
    unsafe fn free(&self, ptr: *mut u8);

    /// Resize to `new_size`, keeping `align`. On failure the old chunk is
    /// untouched and null is returned.
    ///
    /// # Safety
    ///
    /// `ptr` came from this host with alignment `align` and is live.
    unsafe fn realloc(&self, ptr: *mut u8, align: usize, new_size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` came from this host and is live.
    unsafe fn usable_size(&self, ptr: *const u8) -> usize;
}

fn site_of(location: &'static Location<'static>) -> usize {
    location as *const Location<'static> as usize
}

impl<H: HostAllocator> HeapIndex<H> {
    /// Should this call skip indexing entirely? True for our own bookkeeping
    /// allocations, whichever way they come back in.
    fn bypassing(&self) -> bool {
        context::is_bypassing() || self.lock_held_by_current_thread()
    }

    /// Allocate through the host and index the result. The allocation site is
    /// the pending tag if there is one, else the caller's source location.
    ///
    /// # Safety
    ///
    /// `align` is a power of two.
    #[track_caller]
    pub unsafe fn malloc(&self, size: usize, align: usize) -> *mut u8 {
        if self.bypassing() {
            return self.host().malloc(size, align);
        }
        let caller = site_of(Location::caller());
        let _allocating = ReentrancyGuard::allocating();
        let (modified_size, modified_align) = self.pre_alloc(size, align);
        let chunk = self.host().malloc(modified_size, modified_align);
        if chunk.is_null() {
            _ = context::take_pending_tag();
            return chunk;
        }
        self.post_successful_alloc(chunk, modified_size, modified_align, size, align, caller);
        chunk
    }

    /// Zeroed [`malloc()`](Self::malloc).
    ///
    /// # Safety
    ///
    /// `align` is a power of two.
    #[track_caller]
    pub unsafe fn calloc(&self, nmemb: usize, size: usize, align: usize) -> *mut u8 {
        let Some(total) = nmemb.checked_mul(size) else {
            return ptr::null_mut();
        };
        let chunk = self.malloc(total, align);
        if !chunk.is_null() {
            ptr::write_bytes(chunk, 0, total);
        }
        chunk
    }

    /// # Safety
    ///
    /// `ptr` is null or came from [`malloc()`](Self::malloc) on this index
    /// and is live.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if self.bypassing() {
            return self.host().free(ptr);
        }
        let _freeing = ReentrancyGuard::freeing();
        let usable = self.host().usable_size(ptr);
        if !self.pre_nonnull_free(ptr, usable) {
            self.host().free(ptr);
        }
        self.post_nonnull_free(ptr);
    }

    /// `realloc(3)`: null `ptr` allocates, zero `new_size` frees.
    ///
    /// # Safety
    ///
    /// `ptr` is null or came from [`malloc()`](Self::malloc) on this index
    /// with alignment `align` and is live.
    #[track_caller]
    pub unsafe fn realloc(&self, ptr: *mut u8, align: usize, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(new_size, align);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        if self.bypassing() {
            return self.host().realloc(ptr, align, new_size);
        }
        let caller = site_of(Location::caller());
        let _allocating = ReentrancyGuard::allocating();
        let old_usable = self.host().usable_size(ptr);
        let (modified_size, modified_align) = self.pre_alloc(new_size, align);
        context::set_current_size(new_size);
        self.pre_nonnull_nonzero_realloc(ptr, modified_size, caller);
        let new_chunk = self.host().realloc(ptr, modified_align, modified_size);
        self.post_nonnull_nonzero_realloc(ptr, modified_size, old_usable, caller, new_chunk);
        context::set_current_size(0);
        new_chunk
    }
}

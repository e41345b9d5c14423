//! C ABI over one process-wide registry and index, for a C allocator that
//! calls the hooks itself. The host is the C library's own heap, so chunk
//! usable sizes come from `malloc_usable_size()`.
//!
//! The host must register each arena (`heapmeta_register_arena`) before the
//! first chunk in it is indexed, and must skip the hooks whenever
//! `heapmeta_is_bypassing()` says so: the index allocates for its own
//! bookkeeping, and those allocations come back through the host.

use std::{
    ffi::{c_int, c_void},
    ptr,
    sync::Arc,
};

use libc::size_t;
use once_cell::sync::Lazy;

use crate::{
    alloc::{
        context::{self, ReentrancyGuard},
        host::HostAllocator,
        index::HeapIndex,
        meta::SiteOrType,
        registry::{AllocatorKind, BigAllocRegistry, RangeRegistry},
    },
    config::IndexConfig,
};

/// The C library heap
pub struct LibcHeap;

// SAFETY: glibc chunks are 16-aligned on 64-bit, and `malloc_usable_size()`
// is stable for a live chunk
unsafe impl HostAllocator for LibcHeap {
    unsafe fn malloc(&self, size: usize, align: usize) -> *mut u8 {
        if align <= 2 * std::mem::size_of::<usize>() {
            return libc::malloc(size).cast();
        }
        let mut out = ptr::null_mut();
        match libc::posix_memalign(&mut out, align, size) {
            0 => out.cast(),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        libc::free(ptr.cast())
    }

    unsafe fn realloc(&self, ptr: *mut u8, align: usize, new_size: usize) -> *mut u8 {
        if align <= 2 * std::mem::size_of::<usize>() {
            return libc::realloc(ptr.cast(), new_size).cast();
        }
        let new = self.malloc(new_size, align);
        if !new.is_null() {
            let old_size = self.usable_size(ptr);
            ptr::copy_nonoverlapping(ptr, new, old_size.min(new_size));
            self.free(ptr);
        }
        new
    }

    unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        libc::malloc_usable_size(ptr as *mut c_void)
    }
}

static REGISTRY: Lazy<Arc<RangeRegistry>> = Lazy::new(|| Arc::new(RangeRegistry::new()));

static INDEX: Lazy<HeapIndex<LibcHeap>> = Lazy::new(|| {
    let _bookkeeping = ReentrancyGuard::allocating();
    let registry: Arc<dyn BigAllocRegistry> = REGISTRY.clone();
    HeapIndex::new(LibcHeap, registry, IndexConfig::from_env())
});

/// Nonzero when the calling thread is inside the index and the host must not
/// call any hook.
#[no_mangle]
pub extern "C" fn heapmeta_is_bypassing() -> c_int {
    let held = Lazy::get(&INDEX).is_some_and(|index| index.lock_held_by_current_thread());
    (context::is_bypassing() || held) as c_int
}

#[no_mangle]
pub unsafe extern "C" fn heapmeta_pre_alloc(
    size: size_t,
    align: size_t,
    out_size: *mut size_t,
    out_align: *mut size_t,
) {
    let (modified_size, modified_align) = INDEX.pre_alloc(size, align);
    *out_size = modified_size;
    *out_align = modified_align;
}

#[no_mangle]
pub unsafe extern "C" fn heapmeta_post_successful_alloc(
    chunk: *mut c_void,
    modified_size: size_t,
    modified_align: size_t,
    requested_size: size_t,
    requested_align: size_t,
    caller: *const c_void,
) {
    let _bookkeeping = ReentrancyGuard::allocating();
    INDEX.post_successful_alloc(
        chunk.cast(),
        modified_size,
        modified_align,
        requested_size,
        requested_align,
        caller as usize,
    );
}

/// Nonzero to veto the host's free
#[no_mangle]
pub unsafe extern "C" fn heapmeta_pre_nonnull_free(chunk: *mut c_void, usable_size: size_t) -> c_int {
    let _bookkeeping = ReentrancyGuard::freeing();
    INDEX.pre_nonnull_free(chunk.cast(), usable_size) as c_int
}

#[no_mangle]
pub unsafe extern "C" fn heapmeta_post_nonnull_free(chunk: *mut c_void) {
    INDEX.post_nonnull_free(chunk.cast());
}

#[no_mangle]
pub unsafe extern "C" fn heapmeta_pre_nonnull_nonzero_realloc(
    chunk: *mut c_void,
    modified_size: size_t,
    caller: *const c_void,
) {
    let _bookkeeping = ReentrancyGuard::allocating();
    INDEX.pre_nonnull_nonzero_realloc(chunk.cast(), modified_size, caller as usize);
}

#[no_mangle]
pub unsafe extern "C" fn heapmeta_post_nonnull_nonzero_realloc(
    chunk: *mut c_void,
    modified_size: size_t,
    old_usable_size: size_t,
    caller: *const c_void,
    new_chunk: *mut c_void,
) {
    let _bookkeeping = ReentrancyGuard::allocating();
    INDEX.post_nonnull_nonzero_realloc(
        chunk.cast(),
        modified_size,
        old_usable_size,
        caller as usize,
        new_chunk.cast(),
    );
}

/// Register `[begin, begin + size)` as a heap arena. `0` on success.
#[no_mangle]
pub extern "C" fn heapmeta_register_arena(begin: *mut c_void, size: size_t) -> c_int {
    let _bookkeeping = ReentrancyGuard::allocating();
    match REGISTRY.create_range(
        begin as usize,
        size,
        None,
        None,
        AllocatorKind::Mapping,
        Some(AllocatorKind::GenericMalloc),
    ) {
        Ok(_) => 0,
        Err(err) => {
            log::error!("heapmeta_register_arena: {err}");
            -1
        }
    }
}

/// Move the end of the arena containing `begin` up to `new_end`. `0` on
/// success, `-1` if no arena contains `begin`.
#[no_mangle]
pub extern "C" fn heapmeta_extend_arena(begin: *mut c_void, new_end: *mut c_void) -> c_int {
    match REGISTRY.find_owning_range(begin as usize, AllocatorKind::GenericMalloc) {
        Some(arena) => {
            REGISTRY.extend_range_end(&arena, new_end as usize);
            0
        }
        None => -1,
    }
}

#[no_mangle]
pub extern "C" fn heapmeta_tag_next_allocation(site: *const c_void, allocfn: *const c_void) {
    context::tag_next_allocation(site as usize, allocfn as usize);
}

/// Describe the object containing `addr`. `0` on success, `-1` if no indexed
/// object contains it. Any out pointer may be null.
#[no_mangle]
pub unsafe extern "C" fn heapmeta_get_info(
    addr: *const c_void,
    out_base: *mut *mut c_void,
    out_size: *mut size_t,
    out_site_or_type: *mut *const c_void,
    out_is_type: *mut c_int,
) -> c_int {
    let Ok(info) = INDEX.get_info(addr as usize) else {
        return -1;
    };
    if !out_base.is_null() {
        *out_base = info.base as *mut c_void;
    }
    if !out_size.is_null() {
        *out_size = info.size;
    }
    if !out_site_or_type.is_null() {
        *out_site_or_type = info.origin.raw() as *const c_void;
    }
    if !out_is_type.is_null() {
        *out_is_type = matches!(info.origin, SiteOrType::Type(_)) as c_int;
    }
    0
}

/// `0` on success, `-1` if no indexed object contains `addr`.
#[no_mangle]
pub extern "C" fn heapmeta_set_type(addr: *const c_void, ty: *const c_void) -> c_int {
    match INDEX.set_type(addr as usize, ty as usize) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

//! [`HeapIndex`]: the chunk lifecycle hooks.
//!
//! A chunk is in exactly one of three states:
//!
//! - unindexed: not allocated yet, freed, or in the middle of a realloc
//! - bitmap-indexed: its caller-visible size is at most the promotion
//!   threshold, and the bit for its start slot is set in its arena's bitmap
//! - promoted: it is bigger than that, and a registry record allocated by
//!   [`AllocatorKind::GenericMalloc`] covers exactly its caller-visible bytes
//!
//! Either way its [`ChunkTrailer`] sits right after the caller-visible bytes.
//! Every transition happens under the [`IndexLock`]. The trailer is always
//! written before the bit (or record) that makes it reachable is published.

use std::{
    cmp,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam::epoch;
use serde::Serialize;

use super::{
    arena::{self, Arenas},
    bitvec::SLOT_SIZE,
    context,
    host::HostAllocator,
    lock::IndexLock,
    meta::{ChunkTrailer, SiteOrType},
    registry::{AllocatorKind, BigAlloc, BigAllocRegistry},
};
use crate::{
    config::IndexConfig,
    error::IndexError,
    fatal_unless,
    util::assert::{aligned_to, fatal},
};

/// Collaborators that cache lookups or track copies hear about it here.
pub trait IndexObserver: Send + Sync {
    /// `[begin, begin + len)` is about to be freed: drop anything cached
    /// about it.
    fn uncache_range(&self, begin: usize, len: usize) {
        _ = (begin, len);
    }

    /// A realloc moved `len` caller bytes from `src` to `dst`.
    fn notify_copy(&self, dst: usize, src: usize, len: usize) {
        _ = (dst, src, len);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl IndexObserver for NoopObserver {}

/// Sizes of the biggest objects ever indexed. They only grow: they bound the
/// backward scan, and a stale bigger value only makes it scan further.
#[derive(Debug, Default)]
pub struct HighWaterMarks {
    biggest_allocated: AtomicUsize,
    biggest_unpromoted: AtomicUsize,
}

impl HighWaterMarks {
    pub fn biggest_allocated(&self) -> usize {
        self.biggest_allocated.load(Ordering::Acquire)
    }

    pub fn biggest_unpromoted(&self) -> usize {
        self.biggest_unpromoted.load(Ordering::Acquire)
    }

    fn note_allocated(&self, size: usize) {
        self.biggest_allocated.fetch_max(size, Ordering::AcqRel);
    }

    fn note_unpromoted(&self, size: usize) {
        self.biggest_unpromoted.fetch_max(size, Ordering::AcqRel);
    }
}

/// Insert/delete counts, for diagnostics.
#[derive(Debug, Default)]
pub struct IndexStats {
    inserts: AtomicU64,
    deletes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub inserts: u64,
    pub deletes: u64,
}

impl IndexStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Ring of the most recently freed chunk addresses. Only touched with the
/// index lock held. A capacity of zero turns it off.
struct RecentlyFreed {
    slots: Box<[AtomicUsize]>,
    next: AtomicUsize,
}

impl RecentlyFreed {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    fn contains(&self, chunk: usize) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.load(Ordering::Relaxed) == chunk)
    }

    fn push(&self, chunk: usize) {
        if self.slots.is_empty() {
            return;
        }
        let next = self.next.load(Ordering::Relaxed);
        self.slots[next].store(chunk, Ordering::Relaxed);
        self.next.store((next + 1) % self.slots.len(), Ordering::Relaxed);
    }

    /// `chunk` is live again
    fn forget(&self, chunk: usize) {
        for slot in self.slots.iter() {
            _ = slot.compare_exchange(chunk, 0, Ordering::Relaxed, Ordering::Relaxed);
        }
    }
}

/// How a live chunk is currently represented.
enum IndexEntry {
    Bitmap { arena: BigAlloc, index: usize },
    Promoted(BigAlloc),
}

pub struct HeapIndex<H> {
    host: H,
    registry: Arc<dyn BigAllocRegistry>,
    config: IndexConfig,
    lock: IndexLock,
    marks: HighWaterMarks,
    stats: IndexStats,
    functional: AtomicBool,
    recently_freed: RecentlyFreed,
    observer: Arc<dyn IndexObserver>,
}

impl<H: HostAllocator> HeapIndex<H> {
    pub fn new(host: H, registry: Arc<dyn BigAllocRegistry>, config: IndexConfig) -> Self {
        Self {
            host,
            registry,
            recently_freed: RecentlyFreed::new(config.recently_freed),
            config,
            lock: IndexLock::new(),
            marks: HighWaterMarks::default(),
            stats: IndexStats::default(),
            functional: AtomicBool::new(false),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn IndexObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn registry(&self) -> &dyn BigAllocRegistry {
        &*self.registry
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn marks(&self) -> &HighWaterMarks {
        &self.marks
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Has at least one allocation been indexed? Collaborators use this to
    /// decide whether heap lookups are worth attempting yet.
    pub fn is_functional(&self) -> bool {
        self.functional.load(Ordering::Acquire)
    }

    /// Is `chunk` in the recently-freed ring? Always `false` with the ring
    /// turned off.
    pub fn was_recently_freed(&self, chunk: usize) -> bool {
        let _guard = self.lock.acquire();
        self.recently_freed.contains(chunk)
    }

    pub(crate) fn arenas(&self) -> Arenas<'_> {
        Arenas::new(&*self.registry)
    }

    pub(crate) fn lock_held_by_current_thread(&self) -> bool {
        self.lock.held_by_current_thread()
    }

    pub(crate) fn lock(&self) -> &IndexLock {
        &self.lock
    }

    /// The allocation site for an indexed chunk: the pending tag if the
    /// caller left one, else `caller`.
    fn take_site(caller: usize) -> SiteOrType {
        SiteOrType::Site(context::take_pending_tag().map_or(caller, |tag| tag.site))
    }

    /// Size and alignment to ask the host for, given what the caller asked
    /// for.
    pub fn pre_alloc(&self, size: usize, align: usize) -> (usize, usize) {
        (
            ChunkTrailer::chunk_size_with_trailer(size),
            cmp::max(align, ChunkTrailer::ALIGN),
        )
    }

    /// The host returned `chunk` for a request that [`pre_alloc()`]
    /// turned into `modified_size`/`modified_align`: index it.
    ///
    /// [`pre_alloc()`]: Self::pre_alloc
    pub fn post_successful_alloc(
        &self,
        chunk: *mut u8,
        modified_size: usize,
        modified_align: usize,
        requested_size: usize,
        requested_align: usize,
        caller: usize,
    ) {
        let site = Self::take_site(caller);
        let caller_size = self.index_insert(chunk as usize, site);
        debug_assert!(caller_size >= requested_size);
        log::trace!(
            "alloc {:#x}: asked {requested_size}/{requested_align}, \
             host got {modified_size}/{modified_align}, caller sees {caller_size}",
            chunk as usize
        );
    }

    /// Index `chunk` from scratch. Returns its caller-visible size.
    fn index_insert(&self, chunk: usize, origin: SiteOrType) -> usize {
        fatal_unless!(
            aligned_to(chunk, SLOT_SIZE),
            c"host allocator returned a misaligned chunk"
        );
        let _guard = self.lock.acquire();
        let arena = self.arenas().arena_for(chunk);
        // SAFETY: the host just handed `chunk` out
        let usable = unsafe { self.host.usable_size(chunk as *const u8) };
        let trailer_addr = ChunkTrailer::trailer_addr(chunk, usable);
        let caller_size = trailer_addr - chunk;

        // SAFETY: the trailer is inside the chunk, and the chunk is ours
        unsafe { ChunkTrailer::at(trailer_addr) }.write(origin);
        self.marks.note_allocated(caller_size);

        if caller_size > self.config.promotion_threshold {
            if let Err(err) = self.registry.create_range(
                chunk,
                caller_size,
                None,
                Some(&arena),
                AllocatorKind::GenericMalloc,
                None,
            ) {
                log::error!("promoting {chunk:#x}: {err}");
                fatal(c"could not create a promotion record");
            }
            log::debug!("promoted {chunk:#x} ({caller_size} bytes)");
        } else {
            self.marks.note_unpromoted(caller_size);
            let bitmap = arena::bitmap_for(&arena);
            bitmap.set(arena::slot_index(bitmap, chunk));
        }

        self.recently_freed.forget(chunk);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.functional.store(true, Ordering::Release);
        log::trace!("insert {chunk:#x} size {caller_size} origin {origin:?}");
        caller_size
    }

    /// How `chunk` is indexed right now, if at all. Call with the lock held.
    fn entry_for(&self, chunk: usize) -> Option<IndexEntry> {
        let arenas = self.arenas();
        let arena = arenas.find_arena(chunk)?;
        if let Some(record) = arenas.promoted_at(chunk, &arena) {
            return Some(IndexEntry::Promoted(record));
        }
        let bitmap = arena::existing_bitmap(&arena)?;
        let guard = epoch::pin();
        let view = bitmap.view(&guard)?;
        let index = view.index_of(chunk)?;
        view.is_set(index)
            .then_some(IndexEntry::Bitmap { arena, index })
    }

    /// Drop `chunk` from the index. Returns `false` if it wasn't indexed.
    fn index_delete(&self, chunk: usize) -> bool {
        let _guard = self.lock.acquire();
        let deleted = match self.entry_for(chunk) {
            Some(IndexEntry::Promoted(_)) => self
                .registry
                .delete_range(chunk, AllocatorKind::GenericMalloc)
                .is_some(),
            Some(IndexEntry::Bitmap { arena, index }) => {
                arena::bitmap_for(&arena).clear(index);
                true
            }
            None => false,
        };
        if deleted {
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
            log::trace!("delete {chunk:#x}");
        } else {
            log::debug!("delete {chunk:#x}: not indexed");
        }
        deleted
    }

    /// About to free `chunk`, whose host usable size is `usable_size`.
    /// Returns `true` to veto the host free, which never happens here.
    pub fn pre_nonnull_free(&self, chunk: *mut u8, usable_size: usize) -> bool {
        let chunk = chunk as usize;
        // Before the memory can be reused, so caches never outlive the chunk
        self.observer
            .uncache_range(chunk, ChunkTrailer::caller_usable_size(chunk, usable_size));

        let _guard = self.lock.acquire();
        if self.recently_freed.contains(chunk) {
            log::warn!("double free of {chunk:#x}");
            return false;
        }
        self.index_delete(chunk);
        self.recently_freed.push(chunk);
        false
    }

    pub fn post_nonnull_free(&self, chunk: *mut u8) {
        _ = chunk;
    }

    /// Unindex `chunk` before the host gets to move or shrink it: an in-place
    /// shrink can overwrite the trailer before we could read it.
    pub fn pre_nonnull_nonzero_realloc(&self, chunk: *mut u8, modified_size: usize, caller: usize) {
        let _guard = self.lock.acquire();
        self.index_delete(chunk as usize);
        log::trace!(
            "realloc {:#x} to {modified_size} from {caller:#x}",
            chunk as usize
        );
    }

    /// The host reallocated `chunk` (whose usable size was `old_usable_size`)
    /// to `new_chunk`, or failed to if `new_chunk` is null.
    pub fn post_nonnull_nonzero_realloc(
        &self,
        chunk: *mut u8,
        modified_size: usize,
        old_usable_size: usize,
        caller: usize,
        new_chunk: *mut u8,
    ) {
        let old = chunk as usize;
        let new = new_chunk as usize;
        let requested = context::current_size()
            .unwrap_or_else(|| modified_size.saturating_sub(ChunkTrailer::SIZE));

        if new_chunk.is_null() {
            // The old chunk is still live and its trailer untouched
            _ = context::take_pending_tag();
            let _guard = self.lock.acquire();
            if self.entry_for(old).is_none() {
                // SAFETY: the old chunk is still allocated
                let origin = unsafe {
                    ChunkTrailer::at(ChunkTrailer::trailer_addr(old, old_usable_size))
                }
                .read();
                self.index_insert(old, origin);
            }
            return;
        }

        let site = Self::take_site(caller);
        if new != old {
            // `old` is back with the host and may already belong to another
            // chunk, so its slot is not ours to touch here
            let _guard = self.lock.acquire();
            let new_size = self.index_insert(new, site);
            let moved = cmp::min(
                new_size,
                ChunkTrailer::caller_usable_size(old, old_usable_size),
            );
            self.observer.notify_copy(new, old, moved);
            debug_assert!(new_size >= requested);
            return;
        }

        let _guard = self.lock.acquire();
        match self.entry_for(old) {
            // The host didn't call pre_realloc, so the record survived
            Some(IndexEntry::Promoted(record)) => {
                // SAFETY: the chunk was just resized in place, it's live
                let usable = unsafe { self.host.usable_size(chunk) };
                let trailer_addr = ChunkTrailer::trailer_addr(old, usable);
                let new_size = trailer_addr - old;
                if new_size < record.size() && new_size > self.config.promotion_threshold {
                    self.registry.truncate_range_end(&record, trailer_addr);
                    // SAFETY: inside the live chunk
                    unsafe { ChunkTrailer::at(trailer_addr) }.write(site);
                    log::debug!("truncated promoted {old:#x} to {new_size} bytes");
                } else {
                    self.index_delete(old);
                    self.index_insert(old, site);
                }
            }
            Some(IndexEntry::Bitmap { .. }) => {
                self.index_delete(old);
                self.index_insert(old, site);
            }
            None => {
                self.index_insert(old, site);
            }
        }
    }

    /// Promote the chunk containing `addr` to a registry record, if it isn't
    /// one already, and hand the record back. The record always spans the
    /// chunk's caller-visible bytes, whatever `size` the caller believes the
    /// object has.
    pub fn ensure_big(&self, addr: usize, size: usize) -> Result<BigAlloc, IndexError> {
        let unindexed = IndexError::UnindexedHeapObject { addr };
        let _guard = self.lock.acquire();
        let arenas = self.arenas();
        let arena = arenas.find_arena(addr).ok_or(unindexed)?;
        if let Some(record) = arenas.promoted_within(addr, &arena) {
            return Ok(record);
        }

        let (chunk, caller_size) = self.lookup_in(&arena, addr).ok_or(unindexed)?;
        if addr + size > chunk + caller_size {
            log::debug!(
                "ensure_big({addr:#x}, {size}): chunk {chunk:#x} only holds {caller_size} bytes"
            );
        }
        let bitmap = arena::bitmap_for(&arena);
        let index = arena::slot_index(bitmap, chunk);
        // One representation at a time
        bitmap.clear(index);
        match arenas.ensure_promoted(chunk, caller_size) {
            Ok(record) => Ok(record),
            Err(err) => {
                bitmap.set(index);
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recently_freed_ring_wraps() {
        let ring = RecentlyFreed::new(2);
        ring.push(0x10);
        ring.push(0x20);
        assert!(ring.contains(0x10));
        ring.push(0x30);
        assert!(!ring.contains(0x10));
        assert!(ring.contains(0x20) && ring.contains(0x30));
        ring.forget(0x30);
        assert!(!ring.contains(0x30));
    }

    #[test]
    fn disabled_ring_remembers_nothing() {
        let ring = RecentlyFreed::new(0);
        ring.push(0x10);
        assert!(!ring.contains(0x10));
    }

    #[test]
    fn marks_only_grow() {
        let marks = HighWaterMarks::default();
        marks.note_unpromoted(64);
        marks.note_unpromoted(16);
        marks.note_allocated(1 << 20);
        marks.note_allocated(32);
        assert_eq!(marks.biggest_unpromoted(), 64);
        assert_eq!(marks.biggest_allocated(), 1 << 20);
    }
}

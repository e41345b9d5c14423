//! Arena resolution. An arena is any registry range whose suballocator is the
//! generic malloc index; its bitmap hangs off the range's private slot and is
//! dropped with it.

use crossbeam::epoch;

use super::{
    bitvec::BitmapStore,
    registry::{AllocatorKind, BigAlloc, BigAllocRegistry},
};
use crate::{error::RegistryError, util::assert::fatal};

/// Arena queries against one registry.
#[derive(Clone, Copy)]
pub struct Arenas<'r> {
    registry: &'r dyn BigAllocRegistry,
}

impl<'r> Arenas<'r> {
    pub fn new(registry: &'r dyn BigAllocRegistry) -> Self {
        Self { registry }
    }

    /// The arena owning `addr`, if there is one.
    pub fn find_arena(&self, addr: usize) -> Option<BigAlloc> {
        self.registry
            .find_owning_range(addr, AllocatorKind::GenericMalloc)
    }

    /// The arena owning `addr`, which the host has just told us it allocated.
    /// Having none means the index has been bypassed or corrupted, and we
    /// abort.
    pub fn arena_for(&self, addr: usize) -> BigAlloc {
        match self.find_arena(addr) {
            Some(arena) => arena,
            None => fatal(c"no arena owns a chunk the host allocator returned"),
        }
    }

    /// The promotion record covering `addr` inside `arena`, if any.
    pub fn promoted_within(&self, addr: usize, arena: &BigAlloc) -> Option<BigAlloc> {
        self.registry
            .find_owning_range_under(addr, AllocatorKind::GenericMalloc, arena)
    }

    /// The promotion record that begins exactly at `chunk`.
    pub fn promoted_at(&self, chunk: usize, arena: &BigAlloc) -> Option<BigAlloc> {
        self.promoted_within(chunk, arena)
            .filter(|record| record.begin() == chunk)
    }

    /// The record covering `addr`, creating one of `size` bytes as a child of
    /// the deepest range there if nothing covers it yet.
    pub fn ensure_promoted(&self, addr: usize, size: usize) -> Result<BigAlloc, RegistryError> {
        if let Some(arena) = self.find_arena(addr) {
            if let Some(existing) = self.promoted_within(addr, &arena) {
                return Ok(existing);
            }
        }
        let parent = self.registry.find_deepest_range(addr);
        let record = self.registry.create_range(
            addr,
            size,
            None,
            parent.as_ref(),
            AllocatorKind::GenericMalloc,
            None,
        )?;
        log::debug!("promoted [{addr:#x}, {:#x})", addr + size);
        Ok(record)
    }
}

/// The arena's bitmap, attached on first use and grown to cover the arena's
/// current bounds. Call with the index lock held.
pub fn bitmap_for(arena: &BigAlloc) -> &BitmapStore {
    let private = arena.private_or_init(|| Box::new(BitmapStore::new()));
    let Some(bitmap) = private.downcast_ref::<BitmapStore>() else {
        fatal(c"arena private data is not a bitmap")
    };
    bitmap.ensure_capacity(arena.begin(), arena.end());
    bitmap
}

/// The arena's bitmap if one was ever attached. Lock-free.
pub fn existing_bitmap(arena: &BigAlloc) -> Option<&BitmapStore> {
    arena.private()?.downcast_ref::<BitmapStore>()
}

/// Bit index of the slot at `chunk` in `bitmap`. `bitmap` must already cover
/// it, which [`bitmap_for()`] guarantees for addresses inside the arena.
pub fn slot_index(bitmap: &BitmapStore, chunk: usize) -> usize {
    let guard = epoch::pin();
    match bitmap.view(&guard).and_then(|view| view.index_of(chunk)) {
        Some(index) => index,
        None => fatal(c"chunk lies below its arena bitmap"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::alloc::{bitvec::WORD_COVERAGE, registry::RangeRegistry};

    fn registry_with_arena() -> (RangeRegistry, BigAlloc) {
        let registry = RangeRegistry::new();
        let arena = registry
            .create_range(
                0x40_0000,
                0x10_0000,
                None,
                None,
                AllocatorKind::Mapping,
                Some(AllocatorKind::GenericMalloc),
            )
            .unwrap();
        (registry, arena)
    }

    #[test]
    fn arena_resolution_skips_other_suballocators() {
        let (registry, arena) = registry_with_arena();
        let arenas = Arenas::new(&registry);
        assert!(Arc::ptr_eq(&arenas.arena_for(0x40_1234), &arena));
        assert!(arenas.find_arena(0x3f_ffff).is_none());
        assert!(arenas.find_arena(0x50_0000).is_none());
    }

    #[test]
    fn bitmap_is_attached_once_and_tracks_growth() {
        let (registry, arena) = registry_with_arena();
        assert!(existing_bitmap(&arena).is_none());
        let first = bitmap_for(&arena) as *const BitmapStore;
        assert_eq!(existing_bitmap(&arena).unwrap() as *const _, first);

        registry.extend_range_end(&arena, 0x60_0000);
        let bitmap = bitmap_for(&arena);
        assert_eq!(bitmap as *const _, first);
        let guard = epoch::pin();
        let view = bitmap.view(&guard).unwrap();
        assert_eq!(view.end_address(), 0x60_0000);
        assert_eq!(slot_index(bitmap, 0x40_0000 + WORD_COVERAGE), 64);
    }

    #[test]
    fn ensure_promoted_reuses_existing_records() {
        let (registry, arena) = registry_with_arena();
        let arenas = Arenas::new(&registry);
        let record = arenas.ensure_promoted(0x41_0000, 0x2_0000).unwrap();
        assert!(Arc::ptr_eq(record.parent().unwrap(), &arena));
        let again = arenas.ensure_promoted(0x41_8000, 0x10).unwrap();
        assert!(Arc::ptr_eq(&record, &again));
        assert!(arenas.promoted_at(0x41_0000, &arena).is_some());
        assert!(arenas.promoted_at(0x41_0010, &arena).is_none());
    }
}

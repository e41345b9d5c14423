//! The read path: address to chunk, without taking the index lock.
//!
//! A lookup can race with inserts, deletes and bitmap growth. What it sees is
//! some interleaving of them: a bit is only ever cleared once its chunk is
//! being freed, words are only ever added, and a trailer is written before
//! the bit that points at it. A chunk freed under a lookup can still be
//! reported, and its trailer may read as garbage; callers must not race a
//! lookup with a free of the same object.

use crossbeam::epoch;
use serde::Serialize;

use super::{
    arena,
    bitvec::WORD_COVERAGE,
    host::HostAllocator,
    index::HeapIndex,
    meta::{ChunkTrailer, SiteOrType},
    registry::BigAlloc,
};
use crate::{error::IndexError, util::num::round_down};

/// What the index knows about one live chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    /// First caller-visible byte
    pub base: usize,
    /// Caller-visible bytes, at least what was asked for
    pub size: usize,
    pub origin: SiteOrType,
    /// Found through a promotion record rather than the bitmap
    pub promoted: bool,
}

impl ChunkInfo {
    pub fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.base + self.size
    }

    fn trailer(&self) -> &ChunkTrailer {
        // SAFETY: the trailer directly follows the caller-visible bytes of a
        //         live chunk
        unsafe { ChunkTrailer::at(self.base + self.size) }
    }
}

impl<H: HostAllocator> HeapIndex<H> {
    /// Find the bitmap-indexed chunk of `arena` containing `addr`, as its
    /// start and caller-visible size.
    pub(crate) fn lookup_in(&self, arena: &BigAlloc, addr: usize) -> Option<(usize, usize)> {
        let bitmap = arena::existing_bitmap(arena)?;
        let guard = epoch::pin();
        let view = bitmap.view(&guard)?;
        let index = view.index_of(addr)?;

        // No unpromoted chunk is bigger than this, so its start can't be
        // further back
        let lower_bound = if self.config().bound_backward_scan {
            let floor = addr.saturating_sub(self.marks().biggest_unpromoted());
            view.index_of(round_down(floor, WORD_COVERAGE)).unwrap_or(0)
        } else {
            0
        };
        let found = view.find_last_set_at_or_before(index, lower_bound)?;
        let chunk = view.address_of(found);

        // SAFETY: a set bit means the host handed `chunk` out and hasn't
        //         finished freeing it
        let usable = unsafe { self.host().usable_size(chunk as *const u8) };
        let plausible = usable >= ChunkTrailer::SIZE
            && chunk.checked_add(usable).is_some_and(|end| end <= arena.end());
        if !plausible {
            // Freed and reused under us
            return None;
        }
        let trailer_addr = ChunkTrailer::trailer_addr(chunk, usable);
        (addr < trailer_addr).then_some((chunk, trailer_addr - chunk))
    }

    /// The chunk containing `addr`.
    pub fn lookup(&self, addr: usize) -> Result<ChunkInfo, IndexError> {
        let unindexed = IndexError::UnindexedHeapObject { addr };
        let arenas = self.arenas();
        let arena = arenas.find_arena(addr).ok_or(unindexed)?;

        if let Some(record) = arenas.promoted_within(addr, &arena) {
            let base = record.begin();
            let size = record.size();
            // SAFETY: a live promotion record spans a live chunk's caller
            //         bytes, the trailer follows them
            let origin = unsafe { ChunkTrailer::at(base + size) }.read();
            return Ok(ChunkInfo {
                base,
                size,
                origin,
                promoted: true,
            });
        }

        let (base, size) = self.lookup_in(&arena, addr).ok_or(unindexed)?;
        // SAFETY: as in `lookup_in()`
        let origin = unsafe { ChunkTrailer::at(base + size) }.read();
        Ok(ChunkInfo {
            base,
            size,
            origin,
            promoted: false,
        })
    }

    /// Base, caller-visible size and allocation site (or asserted type) of
    /// the object containing `addr`.
    pub fn get_info(&self, addr: usize) -> Result<ChunkInfo, IndexError> {
        self.lookup(addr)
    }

    /// Assert that the object containing `addr` has type `ty`, replacing its
    /// allocation site.
    pub fn set_type(&self, addr: usize, ty: usize) -> Result<(), IndexError> {
        let info = self.lookup(addr)?;
        info.trailer().write(SiteOrType::Type(ty));
        log::trace!("set type of {:#x} to {ty:#x}", info.base);
        Ok(())
    }
}

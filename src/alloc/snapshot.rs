//! A point-in-time dump of everything the index holds, for debugging and for
//! tests that want to compare the index against what they allocated.

use crossbeam::epoch;
use serde::Serialize;

use super::{
    arena,
    host::HostAllocator,
    index::{HeapIndex, StatsSnapshot},
    lookup::ChunkInfo,
    meta::ChunkTrailer,
    registry::{AllocatorKind, BigAlloc},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArenaSnapshot {
    pub begin: usize,
    pub end: usize,
    /// Bitmap-indexed chunks, ascending
    pub chunks: Vec<ChunkInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSnapshot {
    pub arenas: Vec<ArenaSnapshot>,
    /// Promoted chunks, ascending
    pub promoted: Vec<ChunkInfo>,
    pub biggest_allocated: usize,
    pub biggest_unpromoted: usize,
    pub functional: bool,
    pub stats: StatsSnapshot,
}

impl IndexSnapshot {
    /// Every indexed chunk, bitmap or promoted, in no particular order.
    pub fn chunks(&self) -> impl Iterator<Item = &ChunkInfo> {
        self.arenas
            .iter()
            .flat_map(|arena| arena.chunks.iter())
            .chain(self.promoted.iter())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn promoted_info(record: &BigAlloc) -> ChunkInfo {
    let (base, size) = (record.begin(), record.size());
    ChunkInfo {
        base,
        size,
        // SAFETY: the snapshot is taken under the index lock, so the chunk
        //         can't be freed while we read its trailer
        origin: unsafe { ChunkTrailer::at(base + size) }.read(),
        promoted: true,
    }
}

impl<H: HostAllocator> HeapIndex<H> {
    fn snapshot_arena(&self, arena: &BigAlloc) -> ArenaSnapshot {
        let mut chunks = Vec::new();
        if let Some(bitmap) = arena::existing_bitmap(arena) {
            let guard = epoch::pin();
            if let Some(view) = bitmap.view(&guard) {
                for index in view.iter_set() {
                    let base = view.address_of(index);
                    // SAFETY: set bit, lock held: the chunk is live
                    let usable = unsafe { self.host().usable_size(base as *const u8) };
                    let trailer_addr = ChunkTrailer::trailer_addr(base, usable);
                    chunks.push(ChunkInfo {
                        base,
                        size: trailer_addr - base,
                        // SAFETY: as above
                        origin: unsafe { ChunkTrailer::at(trailer_addr) }.read(),
                        promoted: false,
                    });
                }
            }
        }
        ArenaSnapshot {
            begin: arena.begin(),
            end: arena.end(),
            chunks,
        }
    }

    /// Walk every arena bitmap and every promotion record. Holds the index
    /// lock throughout, so nothing is inserted or freed meanwhile.
    pub fn snapshot(&self) -> IndexSnapshot {
        let _guard = self.lock().acquire();
        let ranges = self.registry().ranges();
        let arenas = ranges
            .iter()
            .filter(|range| range.suballocator() == Some(AllocatorKind::GenericMalloc))
            .map(|arena| self.snapshot_arena(arena))
            .collect();
        let promoted = ranges
            .iter()
            .filter(|range| {
                range.allocated_by() == AllocatorKind::GenericMalloc
                    && self.arenas().find_arena(range.begin()).is_some()
            })
            .map(promoted_info)
            .collect();
        IndexSnapshot {
            arenas,
            promoted,
            biggest_allocated: self.marks().biggest_allocated(),
            biggest_unpromoted: self.marks().biggest_unpromoted(),
            functional: self.is_functional(),
            stats: self.stats(),
        }
    }
}

//! The big-allocation registry boundary.
//!
//! The registry is a process-wide store of address-range records with
//! parent/child containment. Heap arenas live in it (a record whose
//! suballocator is the generic malloc index), so do promoted chunks (records
//! allocated by generic malloc, parented under their arena), and so do
//! unrelated allocation kinds this crate never looks inside.
//!
//! [`BigAllocRegistry`] is the interface the index consumes.
//! [`RangeRegistry`] is a straightforward in-process implementation of it
//! used by the C surface, the bundled host heap and the tests.

use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::RegistryError;

/// Which allocator a range belongs to (or is suballocated by).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AllocatorKind {
    GenericMalloc,
    Alloca,
    Mapping,
    Stack,
}

/// Private data an arena's suballocator hangs off the record. Dropping the
/// record drops it.
pub type OwnerPrivate = Box<dyn Any + Send + Sync>;

/// Handle to a registry record
pub type BigAlloc = Arc<BigAllocation>;

pub struct BigAllocation {
    begin: usize,
    end: AtomicUsize,
    depth: usize,
    parent: Option<BigAlloc>,
    allocated_by: AllocatorKind,
    suballocator: Option<AllocatorKind>,
    suballocator_private: OnceCell<OwnerPrivate>,
}

impl BigAllocation {
    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.end() - self.begin
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.begin <= addr && addr < self.end()
    }

    /// Number of ancestors
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn parent(&self) -> Option<&BigAlloc> {
        self.parent.as_ref()
    }

    pub fn allocated_by(&self) -> AllocatorKind {
        self.allocated_by
    }

    pub fn suballocator(&self) -> Option<AllocatorKind> {
        self.suballocator
    }

    /// The suballocator's private data, attaching `init()` on first use.
    pub fn private_or_init(&self, init: impl FnOnce() -> OwnerPrivate) -> &OwnerPrivate {
        self.suballocator_private.get_or_init(init)
    }

    pub fn private(&self) -> Option<&OwnerPrivate> {
        self.suballocator_private.get()
    }

    fn is_descendant_of(&self, ancestor: &BigAllocation) -> bool {
        let mut current = self.parent.as_deref();
        while let Some(parent) = current {
            if std::ptr::eq(parent, ancestor) {
                return true;
            }
            current = parent.parent.as_deref();
        }
        false
    }
}

impl fmt::Debug for BigAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigAllocation")
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("end", &format_args!("{:#x}", self.end()))
            .field("depth", &self.depth)
            .field("allocated_by", &self.allocated_by)
            .field("suballocator", &self.suballocator)
            .finish_non_exhaustive()
    }
}

/// The operations the index needs from a big-allocation registry.
pub trait BigAllocRegistry: Send + Sync {
    /// Deepest range containing `addr` whose suballocator is `suballocator`.
    fn find_owning_range(&self, addr: usize, suballocator: AllocatorKind) -> Option<BigAlloc>;

    /// A range allocated by `allocated_by`, containing `addr`, somewhere
    /// below `within`.
    fn find_owning_range_under(
        &self,
        addr: usize,
        allocated_by: AllocatorKind,
        within: &BigAlloc,
    ) -> Option<BigAlloc>;

    /// Register `[begin, begin + size)`.
    fn create_range(
        &self,
        begin: usize,
        size: usize,
        owner_private: Option<OwnerPrivate>,
        parent: Option<&BigAlloc>,
        allocated_by: AllocatorKind,
        suballocator: Option<AllocatorKind>,
    ) -> Result<BigAlloc, RegistryError>;

    /// Remove the range that begins at `addr` and was allocated by
    /// `allocated_by`, handing it back.
    fn delete_range(&self, addr: usize, allocated_by: AllocatorKind) -> Option<BigAlloc>;

    /// Move a range's end down to `new_end`. Never grows it.
    fn truncate_range_end(&self, range: &BigAlloc, new_end: usize);

    /// Move a range's end up to `new_end`, for hosts that extend backing
    /// memory in place. Never shrinks it.
    fn extend_range_end(&self, range: &BigAlloc, new_end: usize);

    /// Deepest range of any kind containing `addr`.
    fn find_deepest_range(&self, addr: usize) -> Option<BigAlloc>;

    /// Every live range, ordered by `begin`.
    fn ranges(&self) -> Vec<BigAlloc>;
}

/// Records sorted by `begin`, behind a reader-writer lock.
#[derive(Default)]
pub struct RangeRegistry {
    ranges: RwLock<Vec<BigAlloc>>,
}

impl RangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }

    /// Deepest range containing `addr` that satisfies `pred`
    fn deepest_matching(&self, addr: usize, pred: impl Fn(&BigAllocation) -> bool) -> Option<BigAlloc> {
        let ranges = self.ranges.read();
        // Only ranges that begin at or before `addr` can contain it
        let upto = ranges.partition_point(|range| range.begin <= addr);
        ranges[..upto]
            .iter()
            .filter(|range| range.contains(addr) && pred(range))
            .max_by_key(|range| range.depth)
            .cloned()
    }
}

impl BigAllocRegistry for RangeRegistry {
    fn find_owning_range(&self, addr: usize, suballocator: AllocatorKind) -> Option<BigAlloc> {
        self.deepest_matching(addr, |range| range.suballocator == Some(suballocator))
    }

    fn find_owning_range_under(
        &self,
        addr: usize,
        allocated_by: AllocatorKind,
        within: &BigAlloc,
    ) -> Option<BigAlloc> {
        self.deepest_matching(addr, |range| {
            range.allocated_by == allocated_by && range.is_descendant_of(within)
        })
    }

    fn create_range(
        &self,
        begin: usize,
        size: usize,
        owner_private: Option<OwnerPrivate>,
        parent: Option<&BigAlloc>,
        allocated_by: AllocatorKind,
        suballocator: Option<AllocatorKind>,
    ) -> Result<BigAlloc, RegistryError> {
        if size == 0 {
            return Err(RegistryError::Empty { begin });
        }
        let end = begin + size;
        if let Some(parent) = parent {
            if begin < parent.begin || end > parent.end() {
                return Err(RegistryError::OutsideParent {
                    begin,
                    end,
                    parent_begin: parent.begin,
                    parent_end: parent.end(),
                });
            }
        }

        let mut ranges = self.ranges.write();
        // Ranges must nest or be disjoint. Anything we partially overlap, or
        // that sits at our own level and overlaps us at all, is a conflict.
        let depth = parent.map_or(0, |parent| parent.depth + 1);
        for other in ranges.iter() {
            let (other_begin, other_end) = (other.begin, other.end());
            let overlaps = begin < other_end && other_begin < end;
            if !overlaps {
                continue;
            }
            let we_nest_in_it = other_begin <= begin && end <= other_end;
            let it_nests_in_us = begin <= other_begin && other_end <= end;
            let is_ancestor = parent.is_some_and(|parent| {
                Arc::ptr_eq(parent, other) || parent.is_descendant_of(other)
            });
            if (we_nest_in_it && is_ancestor) || (it_nests_in_us && other.depth > depth) {
                continue;
            }
            return Err(RegistryError::Overlap {
                begin,
                end,
                other_begin,
                other_end,
            });
        }

        let suballocator_private = OnceCell::new();
        if let Some(private) = owner_private {
            _ = suballocator_private.set(private);
        }
        let range = Arc::new(BigAllocation {
            begin,
            end: AtomicUsize::new(end),
            depth,
            parent: parent.cloned(),
            allocated_by,
            suballocator,
            suballocator_private,
        });
        let at = ranges.partition_point(|other| other.begin <= begin);
        ranges.insert(at, Arc::clone(&range));
        Ok(range)
    }

    fn delete_range(&self, addr: usize, allocated_by: AllocatorKind) -> Option<BigAlloc> {
        let mut ranges = self.ranges.write();
        let at = ranges
            .iter()
            .position(|range| range.begin == addr && range.allocated_by == allocated_by)?;
        Some(ranges.remove(at))
    }

    fn truncate_range_end(&self, range: &BigAlloc, new_end: usize) {
        let _guard = self.ranges.write();
        debug_assert!(new_end > range.begin);
        range.end.fetch_min(new_end, Ordering::AcqRel);
    }

    fn extend_range_end(&self, range: &BigAlloc, new_end: usize) {
        let _guard = self.ranges.write();
        range.end.fetch_max(new_end, Ordering::AcqRel);
    }

    fn find_deepest_range(&self, addr: usize) -> Option<BigAlloc> {
        self.deepest_matching(addr, |_| true)
    }

    fn ranges(&self) -> Vec<BigAlloc> {
        self.ranges.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(registry: &RangeRegistry, begin: usize, size: usize) -> BigAlloc {
        registry
            .create_range(
                begin,
                size,
                None,
                None,
                AllocatorKind::Mapping,
                Some(AllocatorKind::GenericMalloc),
            )
            .unwrap()
    }

    #[test]
    fn owning_range_is_the_deepest_with_that_suballocator() {
        let registry = RangeRegistry::new();
        let arena = arena(&registry, 0x10000, 0x10000);
        let chunk = registry
            .create_range(0x12000, 0x1000, None, Some(&arena), AllocatorKind::GenericMalloc, None)
            .unwrap();

        let owner = registry
            .find_owning_range(0x12800, AllocatorKind::GenericMalloc)
            .unwrap();
        assert!(Arc::ptr_eq(&owner, &arena));

        let deepest = registry.find_deepest_range(0x12800).unwrap();
        assert!(Arc::ptr_eq(&deepest, &chunk));
        assert_eq!(deepest.depth(), 1);

        let under = registry
            .find_owning_range_under(0x12fff, AllocatorKind::GenericMalloc, &arena)
            .unwrap();
        assert!(Arc::ptr_eq(&under, &chunk));
        assert!(registry
            .find_owning_range_under(0x13000, AllocatorKind::GenericMalloc, &arena)
            .is_none());
    }

    #[test]
    fn children_must_fit_their_parent() {
        let registry = RangeRegistry::new();
        let arena = arena(&registry, 0x10000, 0x1000);
        let err = registry
            .create_range(0x10800, 0x1000, None, Some(&arena), AllocatorKind::GenericMalloc, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::OutsideParent { .. }));
    }

    #[test]
    fn siblings_may_not_overlap() {
        let registry = RangeRegistry::new();
        let arena = arena(&registry, 0x10000, 0x10000);
        registry
            .create_range(0x11000, 0x1000, None, Some(&arena), AllocatorKind::GenericMalloc, None)
            .unwrap();
        let err = registry
            .create_range(0x11800, 0x1000, None, Some(&arena), AllocatorKind::GenericMalloc, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Overlap { .. }));
        assert!(matches!(
            registry.create_range(0x20000, 0, None, None, AllocatorKind::Mapping, None),
            Err(RegistryError::Empty { .. })
        ));
    }

    #[test]
    fn delete_truncate_and_extend() {
        let registry = RangeRegistry::new();
        let arena = arena(&registry, 0x10000, 0x1000);
        registry.extend_range_end(&arena, 0x14000);
        assert_eq!(arena.end(), 0x14000);
        registry.extend_range_end(&arena, 0x12000);
        assert_eq!(arena.end(), 0x14000);

        let chunk = registry
            .create_range(0x11000, 0x2000, None, Some(&arena), AllocatorKind::GenericMalloc, None)
            .unwrap();
        registry.truncate_range_end(&chunk, 0x11800);
        assert!(chunk.contains(0x117ff));
        assert!(!chunk.contains(0x11800));

        assert!(registry.delete_range(0x11000, AllocatorKind::Mapping).is_none());
        let deleted = registry
            .delete_range(0x11000, AllocatorKind::GenericMalloc)
            .unwrap();
        assert!(Arc::ptr_eq(&deleted, &chunk));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn private_data_is_attached_once() {
        let registry = RangeRegistry::new();
        let arena = arena(&registry, 0x10000, 0x1000);
        assert!(arena.private().is_none());
        let first = arena.private_or_init(|| Box::new(7u32));
        assert_eq!(first.downcast_ref::<u32>(), Some(&7));
        let second = arena.private_or_init(|| Box::new(9u32));
        assert_eq!(second.downcast_ref::<u32>(), Some(&7));
    }
}

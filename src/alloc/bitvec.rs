//! The per-arena bitmap store. One bit per [`SLOT_SIZE`]-aligned slot of the
//! arena; a set bit means a bitmap-indexed chunk starts at that slot.
//!
//! Mutation (growth, set, clear) happens with the index lock held. Reads
//! happen without it, concurrently with all of the above, so the word buffer
//! is published through a `crossbeam::epoch::Atomic`: growth builds a bigger
//! buffer, copies the old words over (nobody can be writing them, we hold the
//! lock), swaps it in and retires the old one once every pinned reader is
//! done. A reader that loaded the old buffer just misses bits set after the
//! swap, which is indistinguishable from reading slightly earlier.
//!
//! Bits are stored lsb-first: bit index `i` lives in word `i / 64` at bit
//! `i % 64`.

use std::{
    cmp, fmt,
    mem,
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};

use crate::{
    fatal_unless,
    util::{
        assert::fatal,
        hint::cold,
        num::{round_down, round_up},
    },
};

pub type AtomicBitChunk = AtomicU64;
pub type BitChunk = u64;

/// Granularity of chunk starts, `MALLOC_ALIGN` in malloc terms
pub const SLOT_SIZE: usize = 2 * mem::size_of::<usize>();

pub const BITS_PER_WORD: usize = BitChunk::BITS as usize;

/// Bytes of arena covered by one bitmap word
pub const WORD_COVERAGE: usize = SLOT_SIZE * BITS_PER_WORD;

/// Get the index and bit offset for a specified index. For example, if we
/// are using 64-bit chunks, then index 74 would return (1, 10). The second
/// number is guaranteed to be less than `BITS_PER_WORD`.
///
/// The chunk index is not guaranteed to be accessible. You should check
/// first.
fn index_offset(index: usize) -> (usize, usize) {
    let chunk_index = index / BITS_PER_WORD;
    let bit_offset = index % BITS_PER_WORD;
    (chunk_index, bit_offset)
}

/// All bits at or below `bit`
fn mask_through(bit: usize) -> BitChunk {
    if bit == BITS_PER_WORD - 1 {
        BitChunk::MAX
    } else {
        (1 << (bit + 1)) - 1
    }
}

struct BitmapWords {
    /// Address covered by bit 0, always a multiple of [`WORD_COVERAGE`]
    base: usize,
    chunks: Box<[AtomicBitChunk]>,
}

impl BitmapWords {
    fn end(&self) -> usize {
        self.base + self.chunks.len() * WORD_COVERAGE
    }
}

pub struct BitmapStore {
    words: Atomic<BitmapWords>,
}

impl Default for BitmapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapStore {
    pub fn new() -> Self {
        Self {
            words: Atomic::null(),
        }
    }

    /// Make sure the bitmap covers `[begin, end)` (the arena's current
    /// bounds), rounded out to whole words. Cheap when it already does.
    /// Coverage only ever grows: if `begin` moved backward, existing bits are
    /// shifted by whole words so they keep describing the same addresses.
    ///
    /// Returns `true` if the buffer was replaced. The caller must hold the
    /// index lock.
    pub fn ensure_capacity(&self, begin: usize, end: usize) -> bool {
        let guard = epoch::pin();
        let want_base = round_down(begin, WORD_COVERAGE);
        let want_end = round_up(end, WORD_COVERAGE);
        let current = self.words.load(Ordering::Acquire, &guard);
        // SAFETY: we're pinned, and only lock holders ever retire buffers
        let current_ref = unsafe { current.as_ref() };

        let (base, stop) = match current_ref {
            Some(words) => {
                if words.base <= want_base && words.end() >= want_end {
                    return false;
                }
                (
                    cmp::min(words.base, want_base),
                    cmp::max(words.end(), want_end),
                )
            }
            None => (want_base, want_end),
        };

        cold(|| {
            let nwords = (stop - base) / WORD_COVERAGE;
            let chunks: Box<[AtomicBitChunk]> =
                (0..nwords).map(|_| AtomicBitChunk::new(0)).collect();
            if let Some(words) = current_ref {
                let shift = (words.base - base) / WORD_COVERAGE;
                for (i, chunk) in words.chunks.iter().enumerate() {
                    chunks[shift + i].store(chunk.load(Ordering::Relaxed), Ordering::Relaxed);
                }
            }
            log::debug!(
                "bitmap for [{begin:#x}, {end:#x}) now covers [{base:#x}, {stop:#x}) in {nwords} words"
            );
            let old = self
                .words
                .swap(Owned::new(BitmapWords { base, chunks }), Ordering::AcqRel, &guard);
            if !old.is_null() {
                // SAFETY: `old` is unreachable from `self.words` now; pinned
                //         readers keep it alive until they unpin.
                unsafe { guard.defer_destroy(old) };
            }
        });
        true
    }

    fn with_words<R>(&self, f: impl FnOnce(&BitmapWords) -> R) -> R {
        let guard = epoch::pin();
        // SAFETY: pinned for the duration of `f`
        let Some(words) = (unsafe { self.words.load(Ordering::Acquire, &guard).as_ref() }) else {
            fatal(c"bitmap used before ensure_capacity()")
        };
        f(words)
    }

    /// Set the bit at `index` to `1`. Index out of bounds is a fatal error.
    pub fn set(&self, index: usize) {
        self.with_words(|words| {
            let (chunk_index, bit_index) = index_offset(index);
            fatal_unless!(
                chunk_index < words.chunks.len(),
                c"bitmap set() out of bounds"
            );
            words.chunks[chunk_index].fetch_or(1 << bit_index, Ordering::Release);
        });
    }

    /// Set the bit at `index` to `0`. Index out of bounds is a fatal error.
    pub fn clear(&self, index: usize) {
        self.with_words(|words| {
            let (chunk_index, bit_index) = index_offset(index);
            fatal_unless!(
                chunk_index < words.chunks.len(),
                c"bitmap clear() out of bounds"
            );
            words.chunks[chunk_index].fetch_and(!(1 << bit_index), Ordering::Release);
        });
    }

    /// A consistent view of the current words, valid while `guard` is.
    /// `None` until the first `ensure_capacity()`.
    pub fn view<'g>(&self, guard: &'g Guard) -> Option<BitmapView<'g>> {
        let words: Shared<'g, BitmapWords> = self.words.load(Ordering::Acquire, guard);
        // SAFETY: `guard` keeps the buffer alive for `'g`
        unsafe { words.as_ref() }.map(|words| BitmapView { words })
    }
}

impl Drop for BitmapStore {
    fn drop(&mut self) {
        // SAFETY: `&mut self`, so nobody else can be looking at the words
        unsafe {
            let guard = epoch::unprotected();
            let words = self.words.swap(Shared::null(), Ordering::Relaxed, guard);
            if !words.is_null() {
                drop(words.into_owned());
            }
        }
    }
}

impl fmt::Debug for BitmapStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = epoch::pin();
        match self.view(&guard) {
            Some(view) => {
                write!(f, "BitmapStore {{ base: {:#x}, words: [", view.base_address())?;
                for chunk in view.words.chunks.iter() {
                    write!(f, "{:b} ", chunk.load(Ordering::Acquire))?;
                }
                write!(f, "] }}")
            }
            None => write!(f, "BitmapStore {{ unallocated }}"),
        }
    }
}

/// A borrowed snapshot of one word buffer.
#[derive(Clone, Copy)]
pub struct BitmapView<'g> {
    words: &'g BitmapWords,
}

impl<'g> BitmapView<'g> {
    pub fn base_address(&self) -> usize {
        self.words.base
    }

    pub fn word_count(&self) -> usize {
        self.words.chunks.len()
    }

    pub fn nbits(&self) -> usize {
        self.word_count() * BITS_PER_WORD
    }

    /// One past the last covered address
    pub fn end_address(&self) -> usize {
        self.words.end()
    }

    /// Bit index of the slot containing `addr`, `None` below the base. May be
    /// past the end of the bitmap.
    pub fn index_of(&self, addr: usize) -> Option<usize> {
        addr.checked_sub(self.words.base).map(|offset| offset / SLOT_SIZE)
    }

    pub fn address_of(&self, index: usize) -> usize {
        self.words.base + index * SLOT_SIZE
    }

    pub fn is_set(&self, index: usize) -> bool {
        let (chunk_index, bit_index) = index_offset(index);
        self.words
            .chunks
            .get(chunk_index)
            .is_some_and(|chunk| chunk.load(Ordering::Acquire) & (1 << bit_index) != 0)
    }

    /// Scan backward from `index` for a set bit, giving up below
    /// `lower_bound`. An `index` past the end is clamped to the last bit.
    /// Whole words are skipped at a time; within a word the highest set bit
    /// is found with `leading_zeros()`.
    pub fn find_last_set_at_or_before(&self, index: usize, lower_bound: usize) -> Option<usize> {
        let nbits = self.nbits();
        if nbits == 0 {
            return None;
        }
        let index = cmp::min(index, nbits - 1);
        if lower_bound > index {
            return None;
        }

        let (mut chunk_index, bit_index) = index_offset(index);
        let lower_chunk = lower_bound / BITS_PER_WORD;
        // Knock off everything after `index` in its own word
        let mut current = self.words.chunks[chunk_index].load(Ordering::Acquire) & mask_through(bit_index);
        loop {
            if current != 0 {
                let found = chunk_index * BITS_PER_WORD
                    + (BITS_PER_WORD - 1 - current.leading_zeros() as usize);
                return (found >= lower_bound).then_some(found);
            }
            if chunk_index == lower_chunk {
                return None;
            }
            chunk_index -= 1;
            current = self.words.chunks[chunk_index].load(Ordering::Acquire);
        }
    }

    /// Every set bit, in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + 'g {
        let words: &'g BitmapWords = self.words;
        words.chunks.iter().enumerate().flat_map(|(chunk_index, chunk)| {
            let mut bits = chunk.load(Ordering::Acquire);
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(chunk_index * BITS_PER_WORD + bit)
            })
        })
    }
}

//! The chunk metadata record ("trailer") and its layout rules.
//!
//! Every indexed chunk carries a small record physically after the caller's
//! data. The host allocator never sees it as anything but part of the chunk:
//! `pre_alloc` inflates each request by [`ChunkTrailer::SIZE`] (plus
//! alignment padding), and the record lives at the end of whatever usable
//! size the host actually handed out:
//!
//! ```plaintext
//! chunk                                   chunk + usable_size
//! +-------------------------------+-----+--------------+
//! | caller-visible bytes          | pad | ChunkTrailer |
//! +-------------------------------+-----+--------------+
//!                                       ^ trailer_addr = chunk + caller size
//! ```
//!
//! Fields are atomics: the read path loads them without the index lock while
//! the lifecycle hooks may be writing them.

use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::Serialize;

use crate::util::num::{round_down, round_up};

/// `flags` bit: `site_or_type` holds a type pointer, not an allocation site
const TYPE_FLAG: usize = 1;

/// Where an indexed chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SiteOrType {
    /// Program counter (or other site identity) of the allocation
    Site(usize),
    /// A static type descriptor asserted for the chunk after the fact
    Type(usize),
}

impl SiteOrType {
    pub const fn is_type(self) -> bool {
        matches!(self, Self::Type(_))
    }

    pub const fn raw(self) -> usize {
        match self {
            Self::Site(raw) | Self::Type(raw) => raw,
        }
    }
}

#[repr(C)]
pub struct ChunkTrailer {
    site_or_type: AtomicUsize,
    flags: AtomicUsize,
}

impl ChunkTrailer {
    pub const SIZE: usize = mem::size_of::<Self>();
    pub const ALIGN: usize = mem::align_of::<Self>();

    /// Size to ask the host for so that `requested_size` caller bytes and a
    /// trailer fit.
    pub const fn chunk_size_with_trailer(requested_size: usize) -> usize {
        round_up(requested_size, Self::ALIGN) + Self::SIZE
    }

    /// Address of the trailer of a chunk at `chunk` whose host usable size is
    /// `usable_size`.
    pub const fn trailer_addr(chunk: usize, usable_size: usize) -> usize {
        round_down(chunk + usable_size - Self::SIZE, Self::ALIGN)
    }

    /// The part of a host chunk the caller may use: everything before the
    /// trailer.
    pub const fn caller_usable_size(chunk: usize, usable_size: usize) -> usize {
        Self::trailer_addr(chunk, usable_size) - chunk
    }

    /// The trailer at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be [`ChunkTrailer::ALIGN`]-aligned and
    /// [`ChunkTrailer::SIZE`] bytes there must stay mapped for `'a`. The bytes
    /// may be garbage (a chunk freed under our feet): every bit pattern is a
    /// valid trailer.
    pub unsafe fn at<'a>(addr: usize) -> &'a Self {
        debug_assert!(addr % Self::ALIGN == 0);
        &*(addr as *const Self)
    }

    /// Overwrite the whole record.
    pub fn write(&self, origin: SiteOrType) {
        let flags = if origin.is_type() { TYPE_FLAG } else { 0 };
        self.site_or_type.store(origin.raw(), Ordering::Relaxed);
        self.flags.store(flags, Ordering::Release);
    }

    pub fn read(&self) -> SiteOrType {
        let flags = self.flags.load(Ordering::Acquire);
        let raw = self.site_or_type.load(Ordering::Relaxed);
        if flags & TYPE_FLAG != 0 {
            SiteOrType::Type(raw)
        } else {
            SiteOrType::Site(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_grow_by_a_trailer() {
        assert_eq!(ChunkTrailer::SIZE, 2 * mem::size_of::<usize>());
        assert_eq!(ChunkTrailer::chunk_size_with_trailer(0), ChunkTrailer::SIZE);
        assert_eq!(
            ChunkTrailer::chunk_size_with_trailer(16),
            16 + ChunkTrailer::SIZE
        );
        assert_eq!(
            ChunkTrailer::chunk_size_with_trailer(17),
            round_up(17, ChunkTrailer::ALIGN) + ChunkTrailer::SIZE
        );
    }

    #[test]
    fn caller_size_excludes_trailer_and_padding() {
        let chunk = 0x1000;
        assert_eq!(ChunkTrailer::caller_usable_size(chunk, 48), 48 - ChunkTrailer::SIZE);
        // A usable size that isn't a multiple of the alignment loses the slack
        let odd = 48 + ChunkTrailer::ALIGN - 1;
        assert_eq!(ChunkTrailer::caller_usable_size(chunk, odd), 48 - ChunkTrailer::SIZE);
        assert!(ChunkTrailer::caller_usable_size(chunk, ChunkTrailer::chunk_size_with_trailer(21)) >= 21);
    }

    #[test]
    fn record_round_trips_the_discriminator() {
        let trailer = ChunkTrailer {
            site_or_type: AtomicUsize::new(0),
            flags: AtomicUsize::new(0),
        };
        trailer.write(SiteOrType::Site(0xdead));
        assert_eq!(trailer.read(), SiteOrType::Site(0xdead));
        trailer.write(SiteOrType::Type(0xbeef));
        assert_eq!(trailer.read(), SiteOrType::Type(0xbeef));
        assert!(trailer.read().is_type());
    }
}

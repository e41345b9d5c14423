use std::{cell::Cell, ptr};

use libc::{
    __errno_location, mmap, munmap, EACCES, EAGAIN, EBADF, EINVAL, ENFILE, ENOMEM, MAP_ANONYMOUS,
    MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use once_cell::sync::Lazy;

use crate::util::{hint::cold, num::round_up};

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

fn errno_name() -> &'static str {
    // SAFETY: the errno location is always valid for the calling thread
    match unsafe { *__errno_location() } {
        ENOMEM => "ENOMEM", // It's basically just this one
        EACCES => "EACCES",
        EAGAIN => "EAGAIN",
        EBADF => "EBADF",
        EINVAL => "EINVAL",
        ENFILE => "ENFILE",
        _ => "unknown",
    }
}

pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the region is plain anonymous memory, owned by whoever owns this
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned region of at least `size` bytes,
    /// without reserving swap for it. Pages are only backed once touched, so
    /// reserving far more than will ever be used is cheap.
    ///
    /// `None` if the mapping fails or `size` is `0`.
    pub fn map_noreserve(size: usize) -> Option<MmapRegion> {
        if size == 0 {
            return None;
        }
        let size = round_up(size, *PAGE_SIZE);
        // SAFETY: a fresh anonymous private mapping aliases nothing
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            ) as *mut u8
        };
        if ptr as isize == -1 {
            // super duper unlikely
            return cold(|| {
                log::error!("could not mmap() {size} bytes: {}", errno_name());
                None
            });
        }
        Some(MmapRegion { ptr, size })
    }

    pub fn begin(&self) -> usize {
        self.ptr as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `size` are exactly what `mmap()` gave us. Anything
        //         still pointing in here (a heap's chunks, its arena record)
        //         must not outlive the region.
        unsafe { munmap(self.ptr.cast(), self.size) };
    }
}

/// Hands out consecutive page-aligned pieces of a [`MmapRegion`], lowest
/// address first, so that every piece extends the previous one. Nothing is
/// ever given back.
pub struct PageBump {
    region: MmapRegion,
    used: Cell<usize>,
}

impl PageBump {
    pub fn new(region: MmapRegion) -> Self {
        Self {
            region,
            used: Cell::new(0),
        }
    }

    /// Take the next `size` bytes (rounded up to whole pages). Returns the
    /// start and the rounded size, `None` once the region is exhausted.
    pub fn take(&self, size: usize) -> Option<(*mut u8, usize)> {
        let size = round_up(size, *PAGE_SIZE);
        let used = self.used.get();
        if self.region.size - used < size {
            return None;
        }
        self.used.set(used + size);
        // SAFETY: `used + size <= region.size`, so we stay in the mapping
        Some((unsafe { self.region.ptr.add(used) }, size))
    }

    pub fn begin(&self) -> usize {
        self.region.begin()
    }

    /// One past the last byte handed out so far
    pub fn end(&self) -> usize {
        self.region.begin() + self.used.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_mappings_are_refused() {
        assert!(MmapRegion::map_noreserve(0).is_none());
    }

    #[test]
    fn bump_hands_out_contiguous_pages() {
        let page = *PAGE_SIZE;
        let bump = PageBump::new(MmapRegion::map_noreserve(4 * page).unwrap());
        let (first, first_size) = bump.take(1).unwrap();
        assert_eq!(first_size, page);
        let (second, second_size) = bump.take(page + 1).unwrap();
        assert_eq!(second as usize, first as usize + page);
        assert_eq!(second_size, 2 * page);
        assert_eq!(bump.end(), bump.begin() + 3 * page);
        assert!(bump.take(2 * page).is_none());
        // SAFETY: both pieces are mapped read/write
        unsafe {
            first.write(1);
            second.add(second_size - 1).write(2);
        }
    }
}

use std::ffi::CStr;

use super::{hint::cold, print::putstr};

/// Test if `addr` is aligned to a multiple of `align`
pub const fn aligned_to(addr: usize, align: usize) -> bool {
    addr % align == 0
}

/// Report an index corruption and abort the process.
///
/// This never formats and never allocates: it is reachable from inside the
/// allocator hooks, where the heap itself may be what is broken.
pub fn fatal(msg: &CStr) -> ! {
    cold(|| {
        putstr(c"heapmeta: fatal index error");
        putstr(msg);
        std::process::abort()
    })
}

/// `assert!()`, but through [`fatal()`] so that it aborts instead of
/// unwinding across the host allocator.
#[macro_export]
macro_rules! fatal_unless {
    ($cond:expr, $msg:literal) => {
        if !$cond {
            $crate::util::assert::fatal($msg)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::aligned_to;

    #[test]
    fn aligned_to_works() {
        assert!(aligned_to(0, 16));
        assert!(aligned_to(48, 16));
        assert!(!aligned_to(40, 16));
    }
}

use std::ffi::CStr;

/// Write `s` and a newline to stderr... but safe (doesn't use the allocator)
pub fn putstr(s: &CStr) {
    let bytes = s.to_bytes();
    // SAFETY: `bytes` is a live borrow for the duration of both calls, and fd 2
    //         is only ever written to.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
    }
}

/// Basically just `println!()` but chucks the thread name in front of it!
#[macro_export]
macro_rules! thread_println {
    ($($arg:tt)*) => {
        println!(
            "[{}] {}",
            ::std::thread::current().name().unwrap_or("{unknown}"),
            format_args!($($arg)*)
        )
    };
}

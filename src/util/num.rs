/// Round up `n` to the nearest multiple of `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// Round down `n` to the nearest multiple of `to`
pub const fn round_down(n: usize, to: usize) -> usize {
    n - n % to
}

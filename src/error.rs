//! Recoverable errors. Everything else this crate can run into is index
//! corruption and goes through [`crate::util::assert::fatal()`].

use thiserror::Error;

/// Errors surfaced by the read path and the metadata accessor.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IndexError {
    /// Neither a bitmap entry nor a promotion record covers this address.
    /// Callers may probe arbitrary addresses, so this is an ordinary answer.
    #[error("no indexed heap object contains {addr:#x}")]
    UnindexedHeapObject { addr: usize },
    /// Explicit promotion was refused by the registry.
    #[error("promotion failed: {0}")]
    Registry(#[from] RegistryError),
}

/// Errors from [`crate::alloc::registry::RangeRegistry`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("cannot register an empty range at {begin:#x}")]
    Empty { begin: usize },
    #[error("range [{begin:#x}, {end:#x}) escapes its parent [{parent_begin:#x}, {parent_end:#x})")]
    OutsideParent {
        begin: usize,
        end: usize,
        parent_begin: usize,
        parent_end: usize,
    },
    #[error("range [{begin:#x}, {end:#x}) partially overlaps [{other_begin:#x}, {other_end:#x})")]
    Overlap {
        begin: usize,
        end: usize,
        other_begin: usize,
        other_end: usize,
    },
}

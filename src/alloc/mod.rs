//! The heap index proper.

pub mod arena;
pub mod bitvec;
pub mod context;
pub mod descriptor;
pub mod dlmalloc;
pub mod host;
pub mod index;
pub mod lock;
pub mod lookup;
pub mod meta;
pub mod registry;
pub mod snapshot;

//! Per-thread allocation context.
//!
//! A caller that knows more about an allocation than its return address (an
//! instrumented allocation wrapper, a language runtime) can tag the *next*
//! allocation made on its thread with [`tag_next_allocation()`]. The tag is
//! consumed by the next indexed allocation or reallocation on the same
//! thread, whether or not that allocation succeeds. Untagged allocations are
//! attributed to the caller address handed to the hook.
//!
//! The context also carries the two reentrancy guards. While a thread is
//! inside the allocation wrapper (or inside `free()`), any allocation it makes
//! is bookkeeping and takes the unindexed bypass path.

use std::cell::Cell;

struct AllocContext {
    site: Cell<usize>,
    allocfn: Cell<usize>,
    size: Cell<usize>,
    allocating: Cell<bool>,
    freeing: Cell<bool>,
}

impl AllocContext {
    const fn new() -> Self {
        Self {
            site: Cell::new(0),
            allocfn: Cell::new(0),
            size: Cell::new(0),
            allocating: Cell::new(false),
            freeing: Cell::new(false),
        }
    }
}

thread_local! {
    static CONTEXT: AllocContext = const { AllocContext::new() };
}

/// A tag for the next allocation, see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTag {
    /// The allocation site, `0` for none
    pub site: usize,
    /// The allocation function the site called, `0` for unknown
    pub allocfn: usize,
}

/// Tag the next allocation on this thread with `site` (and the allocation
/// function it went through, if known).
pub fn tag_next_allocation(site: usize, allocfn: usize) {
    _ = CONTEXT.try_with(|cx| {
        cx.site.set(site);
        cx.allocfn.set(allocfn);
    });
}

/// Take (and clear) the pending tag, if any.
pub fn take_pending_tag() -> Option<PendingTag> {
    CONTEXT
        .try_with(|cx| {
            let site = cx.site.replace(0);
            let allocfn = cx.allocfn.replace(0);
            (site != 0).then_some(PendingTag { site, allocfn })
        })
        .ok()
        .flatten()
}

/// Look at the pending tag without consuming it.
pub fn pending_tag() -> Option<PendingTag> {
    CONTEXT
        .try_with(|cx| {
            let site = cx.site.get();
            (site != 0).then(|| PendingTag {
                site,
                allocfn: cx.allocfn.get(),
            })
        })
        .ok()
        .flatten()
}

/// Record the caller's requested size for the allocation in flight, `0` to
/// clear it.
pub fn set_current_size(size: usize) {
    _ = CONTEXT.try_with(|cx| cx.size.set(size));
}

/// The caller's requested size for the allocation in flight, if one was set.
pub fn current_size() -> Option<usize> {
    CONTEXT
        .try_with(|cx| cx.size.get())
        .ok()
        .filter(|&size| size != 0)
}

/// Is this thread already inside an allocation or a free? Also `true` once
/// the thread's context has been torn down, since nothing that late should be
/// indexed.
pub fn is_bypassing() -> bool {
    CONTEXT
        .try_with(|cx| cx.allocating.get() || cx.freeing.get())
        .unwrap_or(true)
}

#[derive(Clone, Copy)]
enum GuardKind {
    Allocating,
    Freeing,
}

/// Sets one of the reentrancy flags for as long as it lives.
pub struct ReentrancyGuard {
    kind: GuardKind,
    previous: bool,
}

impl ReentrancyGuard {
    fn enter(kind: GuardKind) -> Self {
        let previous = CONTEXT
            .try_with(|cx| match kind {
                GuardKind::Allocating => cx.allocating.replace(true),
                GuardKind::Freeing => cx.freeing.replace(true),
            })
            .unwrap_or(true);
        Self { kind, previous }
    }

    pub fn allocating() -> Self {
        Self::enter(GuardKind::Allocating)
    }

    pub fn freeing() -> Self {
        Self::enter(GuardKind::Freeing)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        _ = CONTEXT.try_with(|cx| match self.kind {
            GuardKind::Allocating => cx.allocating.set(previous),
            GuardKind::Freeing => cx.freeing.set(previous),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_tag_is_consumed_once() {
        assert_eq!(take_pending_tag(), None);
        tag_next_allocation(0x1234, 0x99);
        assert_eq!(
            pending_tag(),
            Some(PendingTag {
                site: 0x1234,
                allocfn: 0x99
            })
        );
        assert_eq!(take_pending_tag().map(|tag| tag.site), Some(0x1234));
        assert_eq!(take_pending_tag(), None);
    }

    #[test]
    fn guards_nest_and_restore() {
        assert!(!is_bypassing());
        {
            let _outer = ReentrancyGuard::allocating();
            assert!(is_bypassing());
            {
                let _inner = ReentrancyGuard::allocating();
                assert!(is_bypassing());
            }
            assert!(is_bypassing());
        }
        assert!(!is_bypassing());
        let freeing = ReentrancyGuard::freeing();
        assert!(is_bypassing());
        drop(freeing);
        assert!(!is_bypassing());
    }

    #[test]
    fn current_size_zero_means_unset() {
        assert_eq!(current_size(), None);
        set_current_size(48);
        assert_eq!(current_size(), Some(48));
        set_current_size(0);
        assert_eq!(current_size(), None);
    }
}

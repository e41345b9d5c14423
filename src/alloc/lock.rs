//! The index lock. One of these serializes every mutation of a
//! [`HeapIndex`](super::index::HeapIndex): bitmap growth, bit set/clear and
//! promotion-record creation/deletion. The read path never takes it.
//!
//! Bookkeeping done under the lock (growing a bitmap, registering a record)
//! can allocate, and the allocation can come straight back into the same
//! index. Rather than making the lock reentrant, the thread that holds it is
//! recorded in a thread-local, and [`IndexLock::acquire()`] on a lock the
//! current thread already holds hands back a nested guard that does nothing.
//! The allocation wrapper checks [`IndexLock::held_by_current_thread()`] too,
//! and takes the unindexed bypass path.

use std::{cell::Cell, marker::PhantomData, sync::atomic::Ordering};

use linux_futex::{Futex, Private};

/// This futex represents a lock and is unlocked
const FUTEX_UNLOCKED: u32 = 0;

/// This futex represents a lock and is locked, nobody is waiting on it
const FUTEX_LOCKED: u32 = 1;

/// This futex represents a lock and is locked, somebody might be asleep on it
const FUTEX_CONTENDED: u32 = 2;

thread_local! {
    /// Address of the [`IndexLock`] this thread holds, `0` if none
    static HELD_LOCK: Cell<usize> = const { Cell::new(0) };
}

fn held_lock() -> usize {
    // During thread teardown the slot may already be gone: nobody can be
    // holding a lock at that point.
    HELD_LOCK.try_with(Cell::get).unwrap_or(0)
}

fn set_held_lock(addr: usize) {
    _ = HELD_LOCK.try_with(|held| held.set(addr));
}

pub struct IndexLock {
    futex: Futex<Private>,
}

impl Default for IndexLock {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexLock {
    pub const fn new() -> Self {
        Self {
            futex: Futex::new(FUTEX_UNLOCKED),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Is this lock held by the calling thread?
    pub fn held_by_current_thread(&self) -> bool {
        held_lock() == self.addr()
    }

    /// Acquire the lock, sleeping on the futex while another thread has it.
    /// If this thread already holds it, the returned guard is nested and
    /// releases nothing.
    pub fn acquire(&self) -> IndexLockGuard<'_> {
        if self.held_by_current_thread() {
            return IndexLockGuard {
                lock: self,
                nested: true,
                previous: self.addr(),
                _not_send: PhantomData,
            };
        }

        if self
            .futex
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            // Slow path: mark the lock contended so the holder knows to wake
            // us, then sleep until we are the ones who flip it from unlocked.
            while self.futex.value.swap(FUTEX_CONTENDED, Ordering::Acquire) != FUTEX_UNLOCKED {
                _ = self.futex.wait(FUTEX_CONTENDED);
            }
        }

        let previous = held_lock();
        set_held_lock(self.addr());
        IndexLockGuard {
            lock: self,
            nested: false,
            previous,
            _not_send: PhantomData,
        }
    }

    fn release(&self) {
        if self.futex.value.swap(FUTEX_UNLOCKED, Ordering::Release) == FUTEX_CONTENDED {
            self.futex.wake(1);
        }
    }
}

/// RAII guard for [`IndexLock`]. Must be dropped on the thread that acquired
/// it, hence `!Send`.
pub struct IndexLockGuard<'a> {
    lock: &'a IndexLock,
    nested: bool,
    /// Whatever this thread held before, restored on drop
    previous: usize,
    _not_send: PhantomData<*const ()>,
}

impl IndexLockGuard<'_> {
    pub fn is_nested(&self) -> bool {
        self.nested
    }
}

impl Drop for IndexLockGuard<'_> {
    fn drop(&mut self) {
        if self.nested {
            return;
        }
        set_held_lock(self.previous);
        self.lock.release();
    }
}

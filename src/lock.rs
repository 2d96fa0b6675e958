//! The per-endpoint mutual-exclusion lock (spec invariant I4/I5).
//!
//! `tokio::sync::Mutex` has no "force unlock" escape hatch, but child
//! bootstrap needs exactly that: a lock duplicated across `fork()` may read
//! as held even though no task in the child will ever run to release it
//! (spec.md §4.7 step 3). A small `Notify`-backed lock gives us that
//! escape hatch while keeping the same acquire/try-acquire shape tokio's
//! own `Mutex` has.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

pub(crate) struct CoopLock {
    locked: AtomicBool,
    notify: Notify,
}

impl CoopLock {
    pub(crate) fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn try_set(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
    }

    /// Waits, cooperatively, until the lock is free, then takes it.
    pub(crate) async fn acquire(&self) -> LockGuard<'_> {
        loop {
            if self.try_set() {
                return LockGuard { lock: self };
            }
            let notified = self.notify.notified();
            if self.try_set() {
                return LockGuard { lock: self };
            }
            notified.await;
        }
    }

    /// Takes the lock only if it is immediately free. Used by `close()`,
    /// which must never suspend.
    pub(crate) fn try_acquire(&self) -> Option<LockGuard<'_>> {
        self.try_set().then_some(LockGuard { lock: self })
    }

    /// Unconditionally clears the lock, whether or not it is held.
    /// Safe only because the holder (if any) is a task from a parent
    /// process that will never run again in this one.
    pub(crate) fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }
}

pub(crate) struct LockGuard<'a> {
    lock: &'a CoopLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        self.lock.notify.notify_one();
    }
}

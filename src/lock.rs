use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn poisoned(target: &'static str, op: &'static str, kind: &'static str) {
    warn!(
        op,
        target_module = target,
        lock_kind = kind,
        "Recovered from poisoned lock; state may be stale after a panic elsewhere"
    );
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|err| {
        poisoned(target, op, "mutex");
        err.into_inner()
    })
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|err| {
        poisoned(target, op, "rwlock.read");
        err.into_inner()
    })
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|err| {
        poisoned(target, op, "rwlock.write");
        err.into_inner()
    })
}

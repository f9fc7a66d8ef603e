use std::sync::{Mutex, MutexGuard, PoisonError};

/// Run `f` with the lock held
///
/// A poisoned lock is recovered: every value guarded this way stays consistent between
/// statements.
pub(crate) fn with_lock<T, F, R>(name: &str, lock: &Mutex<T>, f: F) -> R
where
    F: FnOnce(MutexGuard<'_, T>) -> R,
{
    tracing::trace!(%name, "taking lock");
    let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
    let result = f(guard);
    tracing::trace!(%name, "released lock");
    result
}

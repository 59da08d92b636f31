use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use tracing::warn;

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned shard lock"
            );
            poisoned.into_inner()
        }
    }
}

/// Bounded lock acquisition for read paths: spins on `try_lock` until
/// the deadline instead of parking indefinitely behind a slow writer.
pub(crate) fn mutex_lock_deadline<'a, T>(
    lock: &'a Mutex<T>,
    timeout: Duration,
    target: &'static str,
    op: &'static str,
) -> Option<MutexGuard<'a, T>> {
    let deadline = Instant::now() + timeout;
    loop {
        match lock.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!(
                    op,
                    target_module = target,
                    lock_kind = "mutex.try_lock",
                    result = "poisoned_recovered",
                    hint = "state may be stale after panic in another thread",
                    "Recovered from poisoned shard lock"
                );
                return Some(poisoned.into_inner());
            }
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::yield_now();
            }
        }
    }
}

//! Test-only helpers shared across this crate's unit tests.

use std::sync::{Mutex, MutexGuard, OnceLock};

/// Environment variables are process-global; serialize tests that mutate
/// them so they cannot interleave and observe each other's values.
pub fn lock_env() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

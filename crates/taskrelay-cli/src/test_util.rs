//! Test-only helpers shared across this crate's unit test modules.

#![cfg(test)]

use std::sync::{Mutex, OnceLock};

/// Serialize tests that mutate process environment variables (`HOME`,
/// `XDG_CONFIG_HOME`, `TASKRELAY_DATABASE_URL`), since `std::env` is
/// process-global and `cargo test` runs unit tests on multiple threads.
pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

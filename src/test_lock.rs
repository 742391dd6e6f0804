#![cfg(test)]

use std::sync::{Mutex, MutexGuard, OnceLock};

static CONFIG_TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serialises unit tests that install a process-wide [`crate::config::LinkerConfig`].
#[inline]
pub fn config_test_guard() -> MutexGuard<'static, ()> {
    CONFIG_TEST_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|err| err.into_inner())
}

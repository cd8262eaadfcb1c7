//! Deep-sleep lock shared by everything that needs clocks to keep running.
//!
//! Timers stop counting in deep sleep, so a burst in flight would stall. The
//! board's idle hook is expected to check [`deep_sleep_allowed`] before
//! entering a deep low-power mode.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::debug;

static DEEP_SLEEP_LOCKS: AtomicU32 = AtomicU32::new(0);

/// Holds deep sleep off until dropped.
#[derive(Debug)]
pub struct DeepSleepLock {
    _private: (),
}

impl DeepSleepLock {
    pub fn acquire() -> Self {
        let previous = DEEP_SLEEP_LOCKS.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            debug!("deep sleep locked");
        }

        Self { _private: () }
    }
}

impl Drop for DeepSleepLock {
    fn drop(&mut self) {
        let previous = DEEP_SLEEP_LOCKS.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            debug!("deep sleep unlocked");
        }
    }
}

/// Number of live [`DeepSleepLock`]s.
pub fn deep_sleep_lock_count() -> u32 {
    DEEP_SLEEP_LOCKS.load(Ordering::SeqCst)
}

/// `true` when no one holds a [`DeepSleepLock`].
pub fn deep_sleep_allowed() -> bool {
    deep_sleep_lock_count() == 0
}

//! Lock helpers.
//!
//! Critical sections in BALLAST never span an `.await` and never leave
//! structures half-updated, so a poisoned mutex still guards valid state.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

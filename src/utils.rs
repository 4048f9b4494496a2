//! Shared utility functions.

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, ignoring poisoning.
///
/// The engine holds its locks only around queue and table manipulation, so
/// a panicking holder cannot leave the protected state torn.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning.
//!
//! Commands are third-party code running on worker threads. A command (or a
//! progress listener) that panics while a tracker or the task registry is
//! locked must not take the whole runner down with it, so every lock in the
//! crate is acquired through these helpers. A poisoned lock is logged and its
//! guard recovered; the protected values are plain numbers and handle maps
//! that stay usable after a panic.
//!
//! ```no_run
//! use std::sync::RwLock;
//! use nocap::locks::{resilient_read, resilient_write};
//!
//! let lock = RwLock::new(0.5_f64);
//! *resilient_write(&lock) = 1.0;
//! assert_eq!(*resilient_read(&lock), 1.0);
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "nocap::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned by a panicking holder; recovering guard"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "nocap::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned by a panicking holder; recovering guard"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering the guard if the mutex is poisoned.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "nocap::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned by a panicking holder; recovering guard"
            );
            poisoned.into_inner()
        }
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CommandError, Result};
use crate::locks::resilient_lock;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    wakeup: Condvar,
}

/// A shared flag that commands poll to find out they should stop.
///
/// Clones share state. Cancelling is one-way; the first reason wins.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every thread blocked in [`wait_timeout`](Self::wait_timeout).
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut stored = resilient_lock(&self.inner.reason);
            if self.inner.cancelled.load(Ordering::SeqCst) {
                return;
            }
            *stored = Some(reason.into());
            self.inner.cancelled.store(true, Ordering::SeqCst);
        }
        self.inner.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        resilient_lock(&self.inner.reason).clone()
    }

    /// Return the cancellation signal for `command` if cancellation was requested.
    pub fn check(&self, command: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(CommandError::cancelled(command, self.reason()))
        } else {
            Ok(())
        }
    }

    /// Sleep for up to `timeout`, returning early (with `true`) on cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = resilient_lock(&self.inner.reason);

        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.wakeup.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Leaf and read-only trackers.

use std::fmt;
use std::sync::{Arc, RwLock};

use super::{clamp_progress, ListenerId, Listeners, ProgressListener, ProgressSnapshot, ProgressTracker};
use crate::locks::{resilient_read, resilient_write};

/// A writable leaf tracker. Every write notifies listeners, changed or not.
#[derive(Default)]
pub struct MutableProgressTracker {
    state: RwLock<ProgressSnapshot>,
    listeners: Listeners,
}

/// The leaf tracker under the name used by listeners-first code.
pub type NotifyingProgressTracker = MutableProgressTracker;

impl MutableProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A leaf that starts out indeterminate.
    pub fn indeterminate() -> Self {
        let tracker = Self::default();
        resilient_write(&tracker.state).is_indeterminate = true;
        tracker
    }

    /// Set the progress, clamped into `[0, 1]`.
    pub fn set_progress(&self, progress: f64) {
        self.update(|state| state.progress = clamp_progress(progress));
    }

    pub fn set_indeterminate(&self, indeterminate: bool) {
        self.update(|state| state.is_indeterminate = indeterminate);
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.update(|state| state.status = Some(status));
    }

    /// Mark the operation finished: progress 1 and no longer indeterminate.
    pub fn complete(&self) {
        self.update(|state| {
            state.progress = 1.0;
            state.is_indeterminate = false;
        });
    }

    /// Overwrite the whole state, as a bound source does.
    pub fn apply(&self, snapshot: &ProgressSnapshot) {
        let snapshot = ProgressSnapshot {
            progress: clamp_progress(snapshot.progress),
            ..snapshot.clone()
        };
        self.update(|state| *state = snapshot);
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn update(&self, change: impl FnOnce(&mut ProgressSnapshot)) {
        let snapshot = {
            let mut state = resilient_write(&self.state);
            change(&mut state);
            state.clone()
        };
        self.listeners.notify(&snapshot);
    }
}

impl ProgressTracker for MutableProgressTracker {
    fn progress(&self) -> f64 {
        resilient_read(&self.state).progress
    }

    fn is_indeterminate(&self) -> bool {
        resilient_read(&self.state).is_indeterminate
    }

    fn status(&self) -> Option<String> {
        resilient_read(&self.state).status.clone()
    }

    fn snapshot(&self) -> ProgressSnapshot {
        resilient_read(&self.state).clone()
    }

    fn subscribe(&self, listener: ProgressListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

impl fmt::Debug for MutableProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableProgressTracker")
            .field("state", &*resilient_read(&self.state))
            .finish()
    }
}

/// Observation-only view of another tracker.
///
/// Handed out by the runner so that observers can watch a task without being
/// able to reach the writable leaf behind it.
#[derive(Clone)]
pub struct ReadOnlyProgressTracker {
    inner: Arc<dyn ProgressTracker>,
}

impl ReadOnlyProgressTracker {
    pub fn new(inner: Arc<dyn ProgressTracker>) -> Self {
        Self { inner }
    }
}

impl ProgressTracker for ReadOnlyProgressTracker {
    fn progress(&self) -> f64 {
        self.inner.progress()
    }

    fn is_indeterminate(&self) -> bool {
        self.inner.is_indeterminate()
    }

    fn status(&self) -> Option<String> {
        self.inner.status()
    }

    fn snapshot(&self) -> ProgressSnapshot {
        self.inner.snapshot()
    }

    fn subscribe(&self, listener: ProgressListener) -> ListenerId {
        self.inner.subscribe(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.unsubscribe(id)
    }
}

impl fmt::Debug for ReadOnlyProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyProgressTracker")
            .field("snapshot", &self.inner.snapshot())
            .finish()
    }
}

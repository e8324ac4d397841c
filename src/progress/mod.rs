// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Observable progress trackers that compose into weighted trees.
//!
//! Every command reports progress through a [`MutableProgressTracker`] handed
//! to it by its caller. Composite commands give each child its own leaf and
//! combine the leaves with an [`AggregateProgressTracker`], which is then bound
//! to the tracker the composite itself received:
//!
//! ```text
//!   runner tracker  <── bind_to ──  Aggregate(chain)
//!                                      ├── leaf(encode)   weight 10
//!                                      └── leaf(upload)   weight 100
//! ```
//!
//! Notifications are delivered synchronously on the thread that changed the
//! value. Trees are built once per `process` call and dropped afterwards.

mod aggregate;
mod tracker;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::locks::{resilient_read, resilient_write};

pub use aggregate::AggregateProgressTracker;
pub use tracker::{MutableProgressTracker, NotifyingProgressTracker, ReadOnlyProgressTracker};

/// Callback invoked with the tracker's state after every change.
pub type ProgressListener = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Handle returned by [`ProgressTracker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressSnapshot {
    /// Completion in `[0, 1]`
    pub progress: f64,
    /// True while the operation cannot estimate its completion
    pub is_indeterminate: bool,
    /// Optional human-readable status
    pub status: Option<String>,
}

impl ProgressSnapshot {
    /// Progress as a whole percentage (0-100).
    pub fn percent(&self) -> u64 {
        (self.progress * 100.0).round() as u64
    }
}

/// An observable progress value in `[0, 1]`.
pub trait ProgressTracker: Send + Sync {
    fn progress(&self) -> f64;

    fn is_indeterminate(&self) -> bool {
        false
    }

    fn status(&self) -> Option<String> {
        None
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            progress: self.progress(),
            is_indeterminate: self.is_indeterminate(),
            status: self.status(),
        }
    }

    /// Register a listener fired after every change.
    fn subscribe(&self, listener: ProgressListener) -> ListenerId;

    /// Remove a listener. Returns false if it was not registered.
    fn unsubscribe(&self, id: ListenerId) -> bool;

    /// Forward every change of this tracker into `target`, one way.
    ///
    /// `target` is synchronised to the current value immediately.
    fn bind_to(&self, target: Arc<MutableProgressTracker>) -> ListenerId {
        target.apply(&self.snapshot());
        self.subscribe(Arc::new(move |snapshot: &ProgressSnapshot| target.apply(snapshot)))
    }
}

/// Clamp into `[0, 1]`; NaN counts as no progress.
pub(crate) fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Listener list shared by the trackers and the runner.
pub(crate) struct Listeners<E: ?Sized = ProgressSnapshot> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Arc<dyn Fn(&E) + Send + Sync>)>>,
}

impl<E: ?Sized> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<E: ?Sized> Listeners<E> {
    pub(crate) fn add(&self, listener: Arc<dyn Fn(&E) + Send + Sync>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        resilient_write(&self.entries).push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = resilient_write(&self.entries);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        resilient_read(&self.entries).len()
    }

    /// Invoke every listener outside the lock so listeners may re-enter.
    pub(crate) fn notify(&self, event: &E) {
        let listeners: Vec<_> = resilient_read(&self.entries)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(
                    target: "nocap::listeners",
                    event = std::any::type_name::<E>(),
                    "listener panicked; continuing with remaining listeners"
                );
            }
        }
    }
}

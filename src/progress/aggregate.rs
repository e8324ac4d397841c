// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Weighted composite tracker.

use std::fmt;
use std::sync::{Arc, Weak};

use super::{clamp_progress, ListenerId, Listeners, ProgressListener, ProgressSnapshot, ProgressTracker};
use crate::error::{CommandError, Result};

/// A tracker whose value is the weighted mean of a fixed set of children.
///
/// `progress = Σ(childᵢ · wᵢ) / Σwᵢ`. When every weight is zero the plain
/// arithmetic mean is used instead; an aggregate with no children reports 0.
///
/// The aggregate re-fires its own listeners whenever any child changes, so
/// nested aggregates propagate a leaf write all the way to the root.
pub struct AggregateProgressTracker {
    children: Vec<(Arc<dyn ProgressTracker>, f64)>,
    total_weight: f64,
    subscriptions: Vec<ListenerId>,
    listeners: Listeners,
}

impl AggregateProgressTracker {
    /// Build an aggregate over `(child, weight)` pairs.
    ///
    /// Weights must be finite and non-negative.
    pub fn new(children: Vec<(Arc<dyn ProgressTracker>, f64)>) -> Result<Arc<Self>> {
        if let Some((_, weight)) = children.iter().find(|(_, w)| !w.is_finite() || *w < 0.0) {
            return Err(CommandError::InvalidArgument(format!(
                "progress weight must be finite and non-negative, got {}",
                weight
            )));
        }

        Ok(Self::build(children))
    }

    /// Build an aggregate in which every child counts the same.
    pub fn equal(children: Vec<Arc<dyn ProgressTracker>>) -> Arc<Self> {
        Self::build(children.into_iter().map(|child| (child, 1.0)).collect())
    }

    fn build(children: Vec<(Arc<dyn ProgressTracker>, f64)>) -> Arc<Self> {
        let total_weight: f64 = children.iter().map(|(_, w)| w).sum();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let subscriptions = children
                .iter()
                .map(|(child, _)| {
                    let weak = weak.clone();
                    child.subscribe(Arc::new(move |_: &ProgressSnapshot| {
                        if let Some(aggregate) = weak.upgrade() {
                            aggregate.listeners.notify(&aggregate.snapshot());
                        }
                    }))
                })
                .collect();

            Self {
                children,
                total_weight,
                subscriptions,
                listeners: Listeners::default(),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.children.iter().map(|(_, w)| *w).collect()
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Children that count towards the value: all of them when the weights
    /// sum to zero, otherwise the ones with a positive weight.
    fn counted(&self) -> impl Iterator<Item = &(Arc<dyn ProgressTracker>, f64)> {
        let all = self.total_weight <= 0.0;
        self.children.iter().filter(move |(_, w)| all || *w > 0.0)
    }
}

impl ProgressTracker for AggregateProgressTracker {
    fn progress(&self) -> f64 {
        if self.children.is_empty() {
            return 0.0;
        }

        let value = if self.total_weight > 0.0 {
            self.children
                .iter()
                .map(|(child, weight)| child.progress() * weight)
                .sum::<f64>()
                / self.total_weight
        } else {
            self.children.iter().map(|(child, _)| child.progress()).sum::<f64>()
                / self.children.len() as f64
        };

        clamp_progress(value)
    }

    fn is_indeterminate(&self) -> bool {
        self.counted()
            .any(|(child, _)| child.is_indeterminate() && child.progress() < 1.0)
    }

    /// Status of the first unfinished child that has one.
    fn status(&self) -> Option<String> {
        self.children
            .iter()
            .filter(|(child, _)| child.progress() < 1.0)
            .find_map(|(child, _)| child.status())
    }

    fn subscribe(&self, listener: ProgressListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

impl Drop for AggregateProgressTracker {
    fn drop(&mut self) {
        for ((child, _), id) in self.children.iter().zip(&self.subscriptions) {
            child.unsubscribe(*id);
        }
    }
}

impl fmt::Debug for AggregateProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateProgressTracker")
            .field("children", &self.children.len())
            .field("weights", &self.weights())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::MutableProgressTracker;
    use std::sync::Mutex;

    const EPSILON: f64 = 1e-9;

    fn leaves(n: usize) -> Vec<Arc<MutableProgressTracker>> {
        (0..n).map(|_| Arc::new(MutableProgressTracker::new())).collect()
    }

    fn weighted(leaves: &[Arc<MutableProgressTracker>], weights: &[f64]) -> Arc<AggregateProgressTracker> {
        let children = leaves
            .iter()
            .zip(weights)
            .map(|(leaf, w)| (leaf.clone() as Arc<dyn ProgressTracker>, *w))
            .collect();
        AggregateProgressTracker::new(children).unwrap()
    }

    #[test]
    fn test_weighted_mean_matches_formula() {
        let weights = [1.0, 10.0, 100.0];
        let leaves = leaves(3);
        let aggregate = weighted(&leaves, &weights);

        let cases: [[f64; 3]; 5] = [
            [0.0, 0.0, 0.0],
            [1.0, 1.0, 1.0],
            [1.0, 0.0, 0.0],
            [0.5, 0.25, 0.75],
            [0.0, 1.0, 0.1],
        ];
        for values in cases {
            for (leaf, value) in leaves.iter().zip(values) {
                leaf.set_progress(value);
            }
            let expected: f64 = values.iter().zip(weights).map(|(p, w)| p * w).sum::<f64>() / 111.0;
            assert!(
                (aggregate.progress() - expected).abs() < EPSILON,
                "values {:?}: got {}, expected {}",
                values,
                aggregate.progress(),
                expected
            );
        }
    }

    #[test]
    fn test_zero_total_weight_falls_back_to_mean() {
        let leaves = leaves(2);
        let aggregate = weighted(&leaves, &[0.0, 0.0]);
        leaves[0].set_progress(1.0);
        assert!((aggregate.progress() - 0.5).abs() < EPSILON);
    }

    #[test]
    fn test_empty_aggregate_reports_zero() {
        let aggregate = AggregateProgressTracker::new(Vec::new()).unwrap();
        assert!(aggregate.is_empty());
        assert_eq!(aggregate.progress(), 0.0);
        assert!(!aggregate.is_indeterminate());
    }

    #[test]
    fn test_rejects_invalid_weights() {
        let leaf: Arc<dyn ProgressTracker> = Arc::new(MutableProgressTracker::new());
        assert!(AggregateProgressTracker::new(vec![(leaf.clone(), -1.0)]).is_err());
        assert!(AggregateProgressTracker::new(vec![(leaf, f64::NAN)]).is_err());
    }

    #[test]
    fn test_child_change_refires() {
        let leaves = leaves(2);
        let aggregate = weighted(&leaves, &[1.0, 1.0]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        aggregate.subscribe(Arc::new(move |s: &ProgressSnapshot| sink.lock().unwrap().push(s.progress)));

        leaves[0].set_progress(1.0);
        leaves[1].set_progress(0.5);

        assert_eq!(*seen.lock().unwrap(), vec![0.5, 0.75]);
    }

    #[test]
    fn test_nested_aggregates_propagate_to_bound_root() {
        let inner_leaves = leaves(2);
        let inner = weighted(&inner_leaves, &[1.0, 1.0]);
        let outer_leaf = Arc::new(MutableProgressTracker::new());
        let outer = AggregateProgressTracker::new(vec![
            (inner.clone() as Arc<dyn ProgressTracker>, 50.0),
            (outer_leaf.clone() as Arc<dyn ProgressTracker>, 50.0),
        ])
        .unwrap();
        let root = Arc::new(MutableProgressTracker::new());
        outer.bind_to(root.clone());

        inner_leaves[0].set_progress(1.0);
        assert!((root.progress() - 0.25).abs() < EPSILON);

        inner_leaves[1].set_progress(1.0);
        outer_leaf.set_progress(1.0);
        assert!((root.progress() - 1.0).abs() < EPSILON);
    }

    #[test]
    fn test_indeterminate_until_child_finishes() {
        let determinate = Arc::new(MutableProgressTracker::new());
        let indeterminate = Arc::new(MutableProgressTracker::indeterminate());
        let aggregate = AggregateProgressTracker::new(vec![
            (determinate as Arc<dyn ProgressTracker>, 1.0),
            (indeterminate.clone() as Arc<dyn ProgressTracker>, 1.0),
        ])
        .unwrap();

        assert!(aggregate.is_indeterminate());
        indeterminate.complete();
        assert!(!aggregate.is_indeterminate());
    }

    #[test]
    fn test_drop_unsubscribes_from_children() {
        let leaf = Arc::new(MutableProgressTracker::new());
        let aggregate = AggregateProgressTracker::equal(vec![leaf.clone() as Arc<dyn ProgressTracker>]);
        assert_eq!(leaf.listener_count(), 1);
        drop(aggregate);
        assert_eq!(leaf.listener_count(), 0);
    }

    #[test]
    fn test_status_from_first_unfinished_child() {
        let leaves = leaves(2);
        let aggregate = weighted(&leaves, &[1.0, 1.0]);
        leaves[0].set_status("encoding");
        leaves[1].set_status("uploading");
        assert_eq!(aggregate.status().as_deref(), Some("encoding"));
        leaves[0].complete();
        assert_eq!(aggregate.status().as_deref(), Some("uploading"));
    }
}

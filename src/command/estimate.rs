// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Static cost estimates used to weight progress.

/// How long a command is expected to take, relative to other commands.
///
/// Only the ratio between weights matters: a chain of an `INSTANTANEOUS`
/// encoder and a `SLOW` upload spends about 1% of its bar on encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeEstimate {
    pub progress_weight: f64,
    /// The command cannot report fine-grained progress.
    pub is_indeterminate: bool,
}

impl TimeEstimate {
    pub const INSTANTANEOUS: TimeEstimate = TimeEstimate::new(1.0);
    pub const FAST: TimeEstimate = TimeEstimate::new(10.0);
    pub const MEDIUM: TimeEstimate = TimeEstimate::new(50.0);
    pub const SLOW: TimeEstimate = TimeEstimate::new(100.0);
    pub const INDETERMINATE: TimeEstimate = TimeEstimate::indeterminate(100.0);

    pub const fn new(progress_weight: f64) -> Self {
        Self {
            progress_weight,
            is_indeterminate: false,
        }
    }

    pub const fn indeterminate(progress_weight: f64) -> Self {
        Self {
            progress_weight,
            is_indeterminate: true,
        }
    }

    /// Estimate for running all of `estimates` one after another.
    pub fn sequence(estimates: impl IntoIterator<Item = TimeEstimate>) -> Self {
        estimates.into_iter().fold(Self::new(0.0), |acc, e| Self {
            progress_weight: acc.progress_weight + e.progress_weight,
            is_indeterminate: acc.is_indeterminate || e.is_indeterminate,
        })
    }

    /// Estimate for running exactly one of `estimates`: the worst case.
    pub fn any_of(estimates: impl IntoIterator<Item = TimeEstimate>) -> Self {
        estimates.into_iter().fold(Self::new(0.0), |acc, e| Self {
            progress_weight: acc.progress_weight.max(e.progress_weight),
            is_indeterminate: acc.is_indeterminate || e.is_indeterminate,
        })
    }
}

impl Default for TimeEstimate {
    fn default() -> Self {
        Self::MEDIUM
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sequential composition of commands.
//!
//! A [`CommandChain`] pipes each command's output into the next command's
//! input. Progress is split across the steps by their time estimates, and
//! every intermediate result is disposed as soon as the step after it has
//! finished with it:
//!
//! ```text
//! input ──▶ encode ──▶ (png bytes) ──▶ upload ──▶ (uri) ──▶ shorten ──▶ output
//!   │                      │                        │
//!   caller keeps it        disposed after upload    disposed after shorten
//! ```

use std::sync::Arc;

use crate::command::{CancellationToken, Command, TimeEstimate};
use crate::data::{TypedData, TypedDataType};
use crate::error::{CommandError, Result};
use crate::progress::{AggregateProgressTracker, MutableProgressTracker, ProgressTracker};

/// Runs a fixed list of commands one after another.
#[derive(Clone)]
pub struct CommandChain {
    name: String,
    commands: Vec<Arc<dyn Command>>,
    factory_id: Option<String>,
}

impl CommandChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            factory_id: None,
        }
    }

    pub fn from_commands(name: impl Into<String>, commands: Vec<Arc<dyn Command>>) -> Self {
        Self {
            commands,
            ..Self::new(name)
        }
    }

    /// Append a step.
    pub fn then(mut self, command: Arc<dyn Command>) -> Self {
        self.commands.push(command);
        self
    }

    pub fn push(&mut self, command: Arc<dyn Command>) {
        self.commands.push(command);
    }

    pub fn with_factory_id(mut self, id: impl Into<String>) -> Self {
        self.factory_id = Some(id.into());
        self
    }

    pub fn commands(&self) -> &[Arc<dyn Command>] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// One leaf per step, aggregated by the steps' weights.
    fn progress_tree(&self) -> Result<(Vec<Arc<MutableProgressTracker>>, Arc<AggregateProgressTracker>)> {
        let mut leaves = Vec::with_capacity(self.commands.len());
        let mut children: Vec<(Arc<dyn ProgressTracker>, f64)> = Vec::with_capacity(self.commands.len());

        for command in &self.commands {
            let estimate = command.time_estimate();
            let leaf = Arc::new(if estimate.is_indeterminate {
                MutableProgressTracker::indeterminate()
            } else {
                MutableProgressTracker::new()
            });
            children.push((leaf.clone(), estimate.progress_weight));
            leaves.push(leaf);
        }

        Ok((leaves, AggregateProgressTracker::new(children)?))
    }
}

impl Command for CommandChain {
    fn name(&self) -> &str {
        &self.name
    }

    /// Whatever the first step accepts; nothing for an empty chain.
    fn input_data_types(&self) -> Vec<TypedDataType> {
        self.commands
            .first()
            .map(|first| first.input_data_types())
            .unwrap_or_default()
    }

    fn time_estimate(&self) -> TimeEstimate {
        TimeEstimate::sequence(self.commands.iter().map(|c| c.time_estimate()))
    }

    fn is_valid(&self) -> bool {
        self.commands.iter().all(|c| c.is_valid())
    }

    fn factory_id(&self) -> Option<&str> {
        self.factory_id.as_deref()
    }

    /// Run every step in order.
    ///
    /// `input` is only ever borrowed by the first step and is never disposed
    /// here. An empty chain hands `input` back unchanged (moving it out).
    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TypedData> {
        if self.commands.is_empty() {
            progress.complete();
            return Ok(input.take());
        }

        let (leaves, aggregate) = self.progress_tree()?;
        aggregate.bind_to(progress.clone());

        let mut current: Option<TypedData> = None;

        for (step, (command, leaf)) in self.commands.iter().zip(&leaves).enumerate() {
            let result = {
                let data: &mut TypedData = match current.as_mut() {
                    Some(intermediate) => intermediate,
                    None => &mut *input,
                };
                tracing::debug!(
                    target: "nocap::chain",
                    chain = %self.name,
                    step,
                    command = command.name(),
                    data_type = %data.data_type(),
                    "running chain step"
                );

                cancel.check(command.name()).and_then(|()| {
                    if command.accepts(data.data_type()) {
                        command.process(data, leaf, cancel)
                    } else {
                        Err(CommandError::unsupported(command.name(), data.data_type()))
                    }
                })
            };

            match result {
                Ok(output) => {
                    if let Some(mut consumed) = current.replace(output) {
                        dispose_step_output(&self.name, step, &mut consumed);
                    }
                    if leaf.progress() < 1.0 {
                        leaf.complete();
                    }
                }
                Err(err) => {
                    if let Some(mut abandoned) = current.take() {
                        dispose_step_output(&self.name, step, &mut abandoned);
                    }
                    if err.is_cancellation() {
                        tracing::debug!(target: "nocap::chain", chain = %self.name, step, "chain cancelled");
                    }
                    return Err(err);
                }
            }
        }

        Ok(current.unwrap_or_default())
    }
}

fn dispose_step_output(chain: &str, step: usize, data: &mut TypedData) {
    if !data.try_dispose() {
        tracing::warn!(target: "nocap::chain", chain, step, "disposer panicked");
    }
}

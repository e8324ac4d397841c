// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The command contract.
//!
//! A [`Command`] turns optional input data into output data, reporting
//! progress through the tracker it is handed and honouring a cooperative
//! [`CancellationToken`]. Leaf commands (encoders, writers, uploaders) and
//! composites ([`CommandChain`](crate::chain::CommandChain),
//! [`DataRouter`](crate::router::DataRouter)) implement the same trait, so
//! any tree of them can be handed to the
//! [`CommandRunner`](crate::runner::CommandRunner).
//!
//! # Ownership of data
//!
//! `process` borrows its input mutably: the command may read streams or move
//! the payload out with [`TypedData::take`], but the caller keeps ownership of
//! the `TypedData` itself, including its disposer, and decides when to dispose
//! it. The returned data belongs to the caller.

mod cancel;
mod estimate;
mod factory;

use std::sync::Arc;

use crate::data::{TypedData, TypedDataType};
use crate::error::{CommandError, Result};
use crate::progress::MutableProgressTracker;

pub use cancel::CancellationToken;
pub use estimate::TimeEstimate;
pub use factory::{CommandFactory, CommandFeatures, CommandProvider};

/// A unit of work in a pipeline.
pub trait Command: Send + Sync {
    /// Display name, also used in logs and cancellation signals.
    fn name(&self) -> &str;

    /// Data types `process` accepts. `None` in the list means the command
    /// can run without input (a source).
    fn input_data_types(&self) -> Vec<TypedDataType>;

    /// Static cost estimate used to weight this command's progress.
    fn time_estimate(&self) -> TimeEstimate;

    /// Whether the command is fully configured and can run.
    fn is_valid(&self) -> bool {
        true
    }

    /// Stable id of the factory that created this command, if any.
    fn factory_id(&self) -> Option<&str> {
        None
    }

    /// Transform `input` into new data.
    ///
    /// Implementations must call [`Command::ensure_accepts`] (or otherwise
    /// reject undeclared types), drive `progress` to 1.0 on success, and
    /// return [`CommandError::Cancelled`] once `cancel` has been tripped.
    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TypedData>;

    fn accepts(&self, data_type: TypedDataType) -> bool {
        self.input_data_types().contains(&data_type)
    }

    /// Reject `input` unless its type is declared by [`Command::input_data_types`].
    fn ensure_accepts(&self, input: &TypedData) -> Result<()> {
        if self.accepts(input.data_type()) {
            Ok(())
        } else {
            Err(CommandError::unsupported(self.name(), input.data_type()))
        }
    }
}

impl std::fmt::Debug for dyn Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name())
            .field("input_data_types", &self.input_data_types())
            .field("time_estimate", &self.time_estimate())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressTracker;

    struct Echo;

    impl Command for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn input_data_types(&self) -> Vec<TypedDataType> {
            vec![TypedDataType::Text]
        }

        fn time_estimate(&self) -> TimeEstimate {
            TimeEstimate::INSTANTANEOUS
        }

        fn process(
            &self,
            input: &mut TypedData,
            progress: &Arc<MutableProgressTracker>,
            cancel: &CancellationToken,
        ) -> Result<TypedData> {
            self.ensure_accepts(input)?;
            cancel.check(self.name())?;
            progress.complete();
            Ok(TypedData::from_text(input.as_text().unwrap_or_default(), input.name()))
        }
    }

    #[test]
    fn test_ensure_accepts_rejects_undeclared_type() {
        let err = Echo.ensure_accepts(&TypedData::from_raw_data(vec![1], "b")).unwrap_err();
        match err {
            CommandError::UnsupportedDataType { command, data_type } => {
                assert_eq!(command, "echo");
                assert_eq!(data_type, TypedDataType::RawData);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_process_reaches_full_progress() {
        let progress = Arc::new(MutableProgressTracker::new());
        let mut input = TypedData::from_text("hi", "greeting");
        let output = Echo.process(&mut input, &progress, &CancellationToken::new()).unwrap();
        assert_eq!(output.as_text(), Some("hi"));
        assert_eq!(progress.snapshot().progress, 1.0);
    }

    #[test]
    fn test_cancelled_token_yields_signal() {
        let token = CancellationToken::new();
        token.cancel("stop");
        let mut input = TypedData::from_text("hi", "greeting");
        let err = Echo.process(&mut input, &Arc::new(MutableProgressTracker::new()), &token).unwrap_err();
        let cancellation = err.cancellation().unwrap();
        assert_eq!(cancellation.command, "echo");
        assert_eq!(cancellation.cause.as_deref(), Some("stop"));
    }
}

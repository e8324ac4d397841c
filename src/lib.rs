// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! nocap - capture, transform and upload through composable commands
//!
//! A pipeline is a tree of [`Command`]s. Leaves do the work (encode an image,
//! write a file, upload over HTTP); [`CommandChain`] runs commands in sequence
//! and [`DataRouter`] branches on the type of the data it receives. Every
//! command reports progress through a tracker, and composites weigh their
//! children's progress by each child's [`TimeEstimate`] so the root reports
//! one coherent value.
//!
//! **Input** -> **Chain / Router** -> **Leaves** -> **Output**
//!
//! # Core Modules
//!
//! - [`data`] - Typed payloads flowing between commands
//! - [`progress`] - Leaf and weighted aggregate progress trackers
//! - [`command`] - The command contract, time estimates and cancellation
//! - [`chain`] / [`router`] - Composition primitives
//! - [`runner`] - Background execution with lifecycle events
//! - [`commands`] - Built-in leaf commands
//! - [`registry`] - Factory registry and default collaborators
//! - [`config`] - JSON settings and named pipelines
//! - [`error`] - Error type and CLI error formatting
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use nocap::{CommandChain, CommandRunner, TypedData};
//! use nocap::commands::{FileSystemWriter, TextOperation, TextTransform};
//!
//! # async fn demo() -> nocap::Result<()> {
//! let chain = CommandChain::new("note")
//!     .then(Arc::new(TextTransform::new(vec![TextOperation::Trim])))
//!     .then(Arc::new(FileSystemWriter::new("/tmp/notes")));
//!
//! let runner = CommandRunner::new();
//! let task = runner.run_with_input(Arc::new(chain), TypedData::from_text("  hello ", "hello"))?;
//! println!("{}", task.wait().await);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod command;
pub mod commands;
pub mod config;
pub mod data;
pub mod error;
pub mod locks;
pub mod progress;
pub mod registry;
pub mod router;
pub mod runner;

pub use chain::CommandChain;
pub use command::{CancellationToken, Command, CommandFactory, CommandFeatures, CommandProvider, TimeEstimate};
pub use config::{load_config, save_config, CommandSpec, Config};
pub use data::{DataPayload, TypedData, TypedDataType};
pub use error::{Cancellation, CommandError, Result};
pub use progress::{
    AggregateProgressTracker, ListenerId, MutableProgressTracker, ProgressSnapshot, ProgressTracker,
    ReadOnlyProgressTracker,
};
pub use registry::{CommandRegistry, FnFactory};
pub use router::DataRouter;
pub use runner::{CommandRunner, CommandTask, RunnerEvent, TaskState};

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task handles returned by the runner.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::command::{CancellationToken, Command};
use crate::error::Cancellation;
use crate::locks::{resilient_read, resilient_write};
use crate::progress::{MutableProgressTracker, ProgressTracker, ReadOnlyProgressTracker};

/// Lifecycle of a [`CommandTask`]. Transitions only move forward:
/// `Created -> Running -> {Completed | Cancelled | Failed}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    /// Registered, worker not yet started
    Created,
    /// The root command is processing
    Running,
    /// The root command returned normally
    Completed,
    /// The root command raised the cancellation signal
    Cancelled {
        command: String,
        reason: Option<String>,
    },
    /// The root command returned an error or panicked
    Failed { error: String },
}

impl TaskState {
    /// Returns true once the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled { .. } | TaskState::Failed { .. }
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    /// The reason given when the task was cancelled; `None` in every other state.
    pub fn cancel_reason(&self) -> Option<&str> {
        match self {
            TaskState::Cancelled { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TaskState::Created => 0,
            TaskState::Running => 1,
            _ => 2,
        }
    }
}

impl From<&Cancellation> for TaskState {
    fn from(cancellation: &Cancellation) -> Self {
        TaskState::Cancelled {
            command: cancellation.command.clone(),
            reason: cancellation.cause.clone(),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => f.write_str("created"),
            TaskState::Running => f.write_str("running"),
            TaskState::Completed => f.write_str("completed"),
            TaskState::Cancelled { reason: Some(reason), .. } => write!(f, "cancelled ({})", reason),
            TaskState::Cancelled { reason: None, .. } => f.write_str("cancelled"),
            TaskState::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Handle to one execution of a root command on a runner worker thread.
pub struct CommandTask {
    id: u64,
    name: String,
    command: Arc<dyn Command>,
    progress: Arc<MutableProgressTracker>,
    cancel: CancellationToken,
    state: RwLock<TaskState>,
    created_at: DateTime<Utc>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
    /// Flips to true after the terminal events have been delivered
    done_tx: watch::Sender<bool>,
}

impl CommandTask {
    pub(crate) fn new(id: u64, command: Arc<dyn Command>) -> Self {
        let progress = if command.time_estimate().is_indeterminate {
            MutableProgressTracker::indeterminate()
        } else {
            MutableProgressTracker::new()
        };
        let (done_tx, _) = watch::channel(false);

        Self {
            id,
            name: command.name().to_string(),
            command,
            progress: Arc::new(progress),
            cancel: CancellationToken::new(),
            state: RwLock::new(TaskState::Created),
            created_at: Utc::now(),
            started_at: RwLock::new(None),
            finished_at: RwLock::new(None),
            done_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &Arc<dyn Command> {
        &self.command
    }

    pub fn state(&self) -> TaskState {
        resilient_read(&self.state).clone()
    }

    /// True strictly between the task starting and reaching a terminal state.
    pub fn is_running(&self) -> bool {
        resilient_read(&self.state).is_running()
    }

    pub fn is_finished(&self) -> bool {
        resilient_read(&self.state).is_terminal()
    }

    /// Read-only view of the task's root progress tracker.
    pub fn progress(&self) -> ReadOnlyProgressTracker {
        ReadOnlyProgressTracker::new(self.progress.clone())
    }

    /// Request cooperative cancellation. Has no effect once the task finished.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(target: "nocap::runner", task_id = self.id, %reason, "cancellation requested");
        self.cancel.cancel(reason);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *resilient_read(&self.started_at)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *resilient_read(&self.finished_at)
    }

    /// Time spent running so far, or in total once finished.
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at()?;
        let end = self.finished_at().unwrap_or_else(Utc::now);
        Some(end - started)
    }

    /// Linear estimate of the time remaining.
    ///
    /// `None` before the task starts, while progress is indeterminate, or
    /// while no progress has been reported yet.
    pub fn eta(&self) -> Option<Duration> {
        if self.is_finished() {
            return Some(Duration::zero());
        }
        let elapsed = self.elapsed()?;
        let snapshot = self.progress.snapshot();
        if snapshot.is_indeterminate || snapshot.progress <= 0.0 {
            return None;
        }

        let elapsed_ms = elapsed.num_milliseconds() as f64;
        let remaining_ms = elapsed_ms * (1.0 - snapshot.progress) / snapshot.progress;
        Some(Duration::milliseconds(remaining_ms.round() as i64))
    }

    /// Resolve once the task is finished and its terminal events have fired.
    pub async fn wait(&self) -> TaskState {
        let mut done_rx = self.done_tx.subscribe();
        loop {
            if *done_rx.borrow_and_update() {
                return self.state();
            }
            if done_rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    pub(crate) fn tracker(&self) -> &Arc<MutableProgressTracker> {
        &self.progress
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move to `next` if it is later in the lifecycle. Returns false otherwise.
    pub(crate) fn transition(&self, next: TaskState) -> bool {
        let mut state = resilient_write(&self.state);
        if next.rank() <= state.rank() {
            tracing::warn!(
                target: "nocap::runner",
                task_id = self.id,
                from = %state.to_string(),
                to = %next.to_string(),
                "ignored backwards task state transition"
            );
            return false;
        }

        let now = Utc::now();
        if next.is_running() {
            *resilient_write(&self.started_at) = Some(now);
        } else if next.is_terminal() {
            *resilient_write(&self.finished_at) = Some(now);
        }
        *state = next;
        true
    }

    pub(crate) fn mark_done(&self) {
        self.done_tx.send_replace(true);
    }
}

impl fmt::Debug for CommandTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("progress", &self.progress.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::TimeEstimate;
    use crate::data::{TypedData, TypedDataType};
    use crate::error::Result;

    struct Noop;

    impl Command for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn input_data_types(&self) -> Vec<TypedDataType> {
            vec![TypedDataType::None]
        }

        fn time_estimate(&self) -> TimeEstimate {
            TimeEstimate::INSTANTANEOUS
        }

        fn process(
            &self,
            _input: &mut TypedData,
            progress: &Arc<MutableProgressTracker>,
            _cancel: &CancellationToken,
        ) -> Result<TypedData> {
            progress.complete();
            Ok(TypedData::none())
        }
    }

    fn task() -> CommandTask {
        CommandTask::new(7, Arc::new(Noop))
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let task = task();
        assert_eq!(task.state(), TaskState::Created);
        assert!(!task.is_running());

        assert!(task.transition(TaskState::Running));
        assert!(task.is_running());
        assert!(task.started_at().is_some());

        assert!(task.transition(TaskState::Completed));
        assert!(!task.is_running());
        assert!(task.finished_at().is_some());

        assert!(!task.transition(TaskState::Running));
        assert!(!task.transition(TaskState::Failed { error: "late".into() }));
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn test_cancel_reason_only_when_cancelled() {
        let cancelled = TaskState::from(&Cancellation {
            command: "upload".into(),
            cause: Some("user".into()),
        });
        assert_eq!(cancelled.cancel_reason(), Some("user"));
        assert_eq!(cancelled.to_string(), "cancelled (user)");
        assert_eq!(TaskState::Completed.cancel_reason(), None);
    }

    #[test]
    fn test_eta() {
        let task = task();
        assert!(task.eta().is_none());

        task.transition(TaskState::Running);
        assert!(task.eta().is_none(), "no progress yet");

        task.tracker().set_progress(0.5);
        assert!(task.eta().is_some());

        task.tracker().set_indeterminate(true);
        assert!(task.eta().is_none());

        task.transition(TaskState::Completed);
        assert_eq!(task.eta(), Some(Duration::zero()));
    }

    #[test]
    fn test_state_serializes_tagged() {
        let json = serde_json::to_string(&TaskState::Failed { error: "boom".into() }).unwrap();
        assert_eq!(json, r#"{"state":"failed","error":"boom"}"#);
    }

    #[tokio::test]
    async fn test_wait_resolves_after_done() {
        let task = Arc::new(task());
        let worker = task.clone();
        std::thread::spawn(move || {
            worker.transition(TaskState::Running);
            worker.transition(TaskState::Completed);
            worker.mark_done();
        });

        let state = tokio::time::timeout(std::time::Duration::from_secs(5), task.wait())
            .await
            .unwrap();
        assert_eq!(state, TaskState::Completed);
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background execution of root commands.
//!
//! [`CommandRunner::run`] validates the command on the caller's thread,
//! registers a [`CommandTask`] and returns it immediately. The command itself
//! runs on a dedicated worker thread, and lifecycle events are delivered to
//! runner listeners on that worker thread, in order:
//!
//! ```text
//! TaskStarted ──▶ ProgressUpdated* ──▶ [TaskCancelled | TaskFailed] ──▶ TaskCompleted
//! ```
//!
//! `TaskCompleted` fires for every terminal state. Whatever the root command
//! returns is disposed by the runner.

mod task;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use indexmap::IndexMap;

use crate::command::Command;
use crate::data::TypedData;
use crate::error::{Cancellation, CommandError, Result};
use crate::locks::{resilient_read, resilient_write};
use crate::progress::{ListenerId, Listeners, ProgressSnapshot, ProgressTracker};

pub use task::{CommandTask, TaskState};

/// Something that happened to a task.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// The worker picked the task up; fired before any work.
    TaskStarted { task: Arc<CommandTask> },
    /// The task's root tracker changed.
    ProgressUpdated {
        task: Arc<CommandTask>,
        snapshot: ProgressSnapshot,
    },
    /// The root command raised the cancellation signal.
    TaskCancelled {
        task: Arc<CommandTask>,
        cancellation: Cancellation,
    },
    /// The root command failed or panicked.
    TaskFailed { task: Arc<CommandTask>, error: String },
    /// The task reached a terminal state, whichever it was.
    TaskCompleted { task: Arc<CommandTask> },
}

impl RunnerEvent {
    pub fn task(&self) -> &Arc<CommandTask> {
        match self {
            RunnerEvent::TaskStarted { task }
            | RunnerEvent::ProgressUpdated { task, .. }
            | RunnerEvent::TaskCancelled { task, .. }
            | RunnerEvent::TaskFailed { task, .. }
            | RunnerEvent::TaskCompleted { task } => task,
        }
    }

    /// Short event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerEvent::TaskStarted { .. } => "task_started",
            RunnerEvent::ProgressUpdated { .. } => "progress_updated",
            RunnerEvent::TaskCancelled { .. } => "task_cancelled",
            RunnerEvent::TaskFailed { .. } => "task_failed",
            RunnerEvent::TaskCompleted { .. } => "task_completed",
        }
    }
}

/// Callback for [`RunnerEvent`]s. Invoked on the task's worker thread.
pub type RunnerListener = Arc<dyn Fn(&RunnerEvent) + Send + Sync>;

struct Shared {
    next_id: AtomicU64,
    tasks: RwLock<IndexMap<u64, Arc<CommandTask>>>,
    listeners: Listeners<RunnerEvent>,
}

impl Shared {
    fn emit(&self, event: RunnerEvent) {
        tracing::trace!(target: "nocap::runner", task_id = event.task().id(), event = event.kind(), "runner event");
        self.listeners.notify(&event);
    }

    /// Worker thread body.
    fn execute(self: Arc<Self>, task: Arc<CommandTask>, mut input: TypedData) {
        task.transition(TaskState::Running);
        tracing::info!(target: "nocap::runner", task_id = task.id(), command = task.name(), "task started");
        self.emit(RunnerEvent::TaskStarted { task: task.clone() });

        let forward = {
            let shared = self.clone();
            let updated = task.clone();
            task.tracker().subscribe(Arc::new(move |snapshot: &ProgressSnapshot| {
                shared.emit(RunnerEvent::ProgressUpdated {
                    task: updated.clone(),
                    snapshot: snapshot.clone(),
                });
            }))
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            task.token().check(task.name())?;
            task.command().process(&mut input, task.tracker(), task.token())
        }));
        task.tracker().unsubscribe(forward);

        let outcome = match outcome {
            Ok(result) => result,
            Err(payload) => Err(CommandError::Panicked(panic_message(payload.as_ref()))),
        };
        let state = match outcome {
            Ok(output) => {
                dispose_quietly(&task, output, "result");
                TaskState::Completed
            }
            Err(CommandError::Cancelled(cancellation)) => TaskState::from(&cancellation),
            Err(err) => TaskState::Failed { error: err.to_string() },
        };
        dispose_quietly(&task, input, "input");

        task.transition(state.clone());
        match &state {
            TaskState::Cancelled { command, reason } => {
                tracing::info!(target: "nocap::runner", task_id = task.id(), %command, ?reason, "task cancelled");
                self.emit(RunnerEvent::TaskCancelled {
                    task: task.clone(),
                    cancellation: Cancellation {
                        command: command.clone(),
                        cause: reason.clone(),
                    },
                });
            }
            TaskState::Failed { error } => {
                tracing::error!(target: "nocap::runner", task_id = task.id(), %error, "task failed");
                self.emit(RunnerEvent::TaskFailed {
                    task: task.clone(),
                    error: error.clone(),
                });
            }
            _ => {
                tracing::info!(target: "nocap::runner", task_id = task.id(), elapsed_ms = ?task.elapsed().map(|d| d.num_milliseconds()), "task completed");
            }
        }
        self.emit(RunnerEvent::TaskCompleted { task: task.clone() });

        resilient_write(&self.tasks).shift_remove(&task.id());
        task.mark_done();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Dispose `data`, logging instead of unwinding if its disposer panics.
fn dispose_quietly(task: &CommandTask, mut data: TypedData, what: &'static str) {
    if !data.try_dispose() {
        tracing::warn!(target: "nocap::runner", task_id = task.id(), what, "disposer panicked");
    }
}

/// Runs root commands on background threads and tracks them until they finish.
///
/// Clones share the same task registry and listeners.
#[derive(Clone)]
pub struct CommandRunner {
    shared: Arc<Shared>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                tasks: RwLock::new(IndexMap::new()),
                listeners: Listeners::default(),
            }),
        }
    }

    /// Register a listener for every task's lifecycle events.
    pub fn subscribe(&self, listener: RunnerListener) -> ListenerId {
        self.shared.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Start `command` with no input, as source commands expect.
    pub fn run(&self, command: Arc<dyn Command>) -> Result<Arc<CommandTask>> {
        self.run_with_input(command, TypedData::none())
    }

    /// Start `command` on a new worker thread and return its task handle.
    ///
    /// Invalid commands and inputs the command does not accept are rejected
    /// here, synchronously, before any thread is spawned. The runner owns
    /// `input` and disposes it when the task finishes.
    pub fn run_with_input(&self, command: Arc<dyn Command>, input: TypedData) -> Result<Arc<CommandTask>> {
        if !command.is_valid() {
            return Err(CommandError::InvalidArgument(format!(
                "command '{}' is not valid and cannot be run",
                command.name()
            )));
        }
        command.ensure_accepts(&input)?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(CommandTask::new(id, command));
        resilient_write(&self.shared.tasks).insert(id, task.clone());

        let shared = self.shared.clone();
        let worker_task = task.clone();
        let spawned = thread::Builder::new()
            .name(format!("nocap-task-{}", id))
            .spawn(move || shared.execute(worker_task, input));

        if let Err(err) = spawned {
            resilient_write(&self.shared.tasks).shift_remove(&id);
            tracing::error!(target: "nocap::runner", task_id = id, error = %err, "failed to spawn worker thread");
            return Err(CommandError::Io(err));
        }

        tracing::debug!(target: "nocap::runner", task_id = id, command = task.name(), "task queued");
        Ok(task)
    }

    /// Tasks that have not finished yet, oldest first.
    pub fn tasks(&self) -> Vec<Arc<CommandTask>> {
        resilient_read(&self.shared.tasks).values().cloned().collect()
    }

    pub fn get(&self, id: u64) -> Option<Arc<CommandTask>> {
        resilient_read(&self.shared.tasks).get(&id).cloned()
    }

    pub fn running_count(&self) -> usize {
        resilient_read(&self.shared.tasks)
            .values()
            .filter(|task| task.is_running())
            .count()
    }

    /// Request cancellation of every unfinished task.
    pub fn cancel_all(&self, reason: &str) {
        for task in self.tasks() {
            task.cancel(reason);
        }
    }

    /// Wait until every task registered at the time of the call has finished.
    pub async fn wait_all(&self) {
        for task in self.tasks() {
            task.wait().await;
        }
    }
}

impl std::fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRunner")
            .field("tasks", &resilient_read(&self.shared.tasks).len())
            .field("listeners", &self.shared.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CancellationToken, TimeEstimate};
    use crate::data::TypedDataType;
    use crate::progress::MutableProgressTracker;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Source {
        panic: bool,
        fail: bool,
    }

    impl Command for Source {
        fn name(&self) -> &str {
            "source"
        }

        fn input_data_types(&self) -> Vec<TypedDataType> {
            vec![TypedDataType::None]
        }

        fn time_estimate(&self) -> TimeEstimate {
            TimeEstimate::FAST
        }

        fn is_valid(&self) -> bool {
            true
        }

        fn process(
            &self,
            _input: &mut TypedData,
            progress: &Arc<MutableProgressTracker>,
            _cancel: &CancellationToken,
        ) -> Result<TypedData> {
            if self.panic {
                panic!("source exploded");
            }
            if self.fail {
                return Err(CommandError::Transport("offline".into()));
            }
            progress.complete();
            Ok(TypedData::from_text("out", "out"))
        }
    }

    fn record(runner: &CommandRunner) -> Arc<Mutex<Vec<&'static str>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        runner.subscribe(Arc::new(move |event: &RunnerEvent| sink.lock().unwrap().push(event.kind())));
        events
    }

    async fn finish(task: &CommandTask) -> TaskState {
        tokio::time::timeout(Duration::from_secs(10), task.wait())
            .await
            .expect("task did not finish")
    }

    #[tokio::test]
    async fn test_completed_lifecycle() {
        let runner = CommandRunner::new();
        let events = record(&runner);

        let task = runner.run(Arc::new(Source { panic: false, fail: false })).unwrap();
        assert_eq!(finish(&task).await, TaskState::Completed);

        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&"task_started"));
        assert_eq!(events.last(), Some(&"task_completed"));
        assert!(events.contains(&"progress_updated"));
        assert!(runner.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_failure_fires_failed_then_completed() {
        let runner = CommandRunner::new();
        let events = record(&runner);

        let task = runner.run(Arc::new(Source { panic: false, fail: true })).unwrap();
        let state = finish(&task).await;
        assert!(matches!(state, TaskState::Failed { ref error } if error.contains("offline")));

        let events = events.lock().unwrap();
        assert_eq!(events.as_slice(), ["task_started", "task_failed", "task_completed"]);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let runner = CommandRunner::new();
        let task = runner.run(Arc::new(Source { panic: true, fail: false })).unwrap();
        let state = finish(&task).await;
        assert!(matches!(state, TaskState::Failed { ref error } if error.contains("source exploded")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let runner = CommandRunner::new();
        let events = record(&runner);
        let task = runner.run(Arc::new(Source { panic: false, fail: false })).unwrap();
        task.cancel("changed my mind");

        // The worker may already have finished; either outcome is terminal.
        let state = finish(&task).await;
        assert!(state.is_terminal());
        let events = events.lock().unwrap();
        assert_eq!(events.last(), Some(&"task_completed"));
        if let TaskState::Cancelled { reason, .. } = state {
            assert_eq!(reason.as_deref(), Some("changed my mind"));
            assert!(events.contains(&"task_cancelled"));
        }
    }

    #[test]
    fn test_rejects_input_of_wrong_type() {
        let runner = CommandRunner::new();
        let err = runner
            .run_with_input(
                Arc::new(Source { panic: false, fail: false }),
                TypedData::from_text("x", "x"),
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::UnsupportedDataType { .. }));
        assert!(runner.tasks().is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}

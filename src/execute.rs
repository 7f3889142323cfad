//! Runs a fixed group of workers as one unit of completion.

use crate::{Error, Result};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

/// Terminal outcome of a task group.
#[derive(Debug)]
pub enum ExecuteResult {
    /// Every task completed without error.
    Success,
    /// At least one task failed; this is the first failure observed.
    Failure(Error),
}

/// Completion handle returned by [`ExecuteEngine::submit_all`].
#[derive(Debug)]
pub struct TaskGroupHandle {
    result_rx: oneshot::Receiver<ExecuteResult>,
    supervisor: JoinHandle<()>,
}

impl TaskGroupHandle {
    /// Waits until every task of the group is terminal.
    ///
    /// Returns `None` if the group was torn down before it could report,
    /// which happens when the runtime shuts down underneath it.
    ///
    /// A supervisor that panicked is reported as a failure, never as an
    /// interruption.
    pub async fn wait(self) -> Option<ExecuteResult> {
        if let Ok(result) = self.result_rx.await {
            return Some(result);
        }

        match self.supervisor.await {
            Err(err) if err.is_panic() => Some(ExecuteResult::Failure(Error::TaskPanicked {
                name: "supervisor".to_string(),
                message: panic_message(err.into_panic()),
            })),
            _ => None,
        }
    }
}

/// Spawns task groups on a Tokio runtime.
///
/// Failed tasks do not cancel their siblings: the group resolves only once
/// all of them have finished.
///
/// Tasks run on the runtime of the caller of
/// [`submit_all`](Self::submit_all).
#[derive(Debug, Clone)]
pub struct ExecuteEngine {
    name: String,
}

impl ExecuteEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Starts every task and returns a handle that resolves once all of
    /// them are terminal.
    ///
    /// `on_failure` runs exactly once, for the first failing task, before
    /// the handle resolves. A panicking task counts as a failure.
    pub fn submit_all<I, F, C>(&self, tasks: I, on_failure: C) -> TaskGroupHandle
    where
        I: IntoIterator<Item = (String, F)>,
        F: Future<Output = Result<()>> + Send + 'static,
        C: FnOnce(&str, &Error) + Send + 'static,
    {
        let mut join_set = JoinSet::new();
        for (name, task) in tasks {
            let task = async move {
                let result = match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(Error::TaskPanicked {
                        name: name.clone(),
                        message: panic_message(panic),
                    }),
                };
                (name, result)
            };

            join_set.spawn(task);
        }

        let submitted = join_set.len();
        info!(engine = %self.name, tasks = submitted, "submitted task group");

        let (result_tx, result_rx) = oneshot::channel();
        let span = tracing::info_span!("task_group", engine = %self.name);
        let supervisor = async move {
            let mut on_failure = Some(on_failure);
            let mut first_failure = None;

            while let Some(joined) = join_set.join_next().await {
                let (name, result) = match joined {
                    Ok(outcome) => outcome,
                    Err(join_err) => (
                        "unknown".to_string(),
                        Err(Error::TaskPanicked {
                            name: "unknown".to_string(),
                            message: join_err.to_string(),
                        }),
                    ),
                };

                match result {
                    Ok(()) => debug!(task = %name, "task completed"),
                    Err(err) => match on_failure.take() {
                        Some(callback) => {
                            error!(task = %name, error = %err, "task failed");
                            let hook = std::panic::catch_unwind(AssertUnwindSafe(|| {
                                callback(&name, &err)
                            }));
                            if let Err(panic) = hook {
                                error!(
                                    task = %name,
                                    "failure callback panicked: {}",
                                    panic_message(panic)
                                );
                            }
                            first_failure = Some(err);
                        }
                        None => warn!(task = %name, error = %err, "task failed after an earlier failure"),
                    },
                }
            }

            let result = match first_failure {
                Some(err) => ExecuteResult::Failure(err),
                None => ExecuteResult::Success,
            };
            debug!(tasks = submitted, "task group terminal");
            let _ = result_tx.send(result);
        }
        .instrument(span);

        TaskGroupHandle {
            result_rx,
            supervisor: tokio::spawn(supervisor),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

//! The incremental task: wires a dumper, a distribution channel and a pool
//! of importers together and drives their lifecycle.

use crate::channel::{AckCallback, DistributionChannel};
use crate::config::TaskConfig;
use crate::datasource::DataSourceManager;
use crate::dumper::{stop_signal, Dumper, SourceFactory, StopTx};
use crate::execute::{ExecuteEngine, ExecuteResult};
use crate::importer::{Importer, ImporterListener, TargetFactory};
use crate::position::Position;
use crate::progress::{Progress, ProgressSnapshot};
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

/// Lifecycle state of an [`IncrementalTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Idle => "idle",
            TaskState::Running => "running",
            TaskState::Stopped => "stopped",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One incremental migration, from a resumable position to a stop or a
/// failure. A task runs at most once; build a new one to retry.
pub struct IncrementalTask {
    config: TaskConfig,
    sources: Arc<dyn SourceFactory>,
    targets: Arc<dyn TargetFactory>,
    engine: ExecuteEngine,
    data_sources: DataSourceManager,
    progress: Arc<Progress>,
    state: Mutex<TaskState>,
    stop_tx: Arc<StopTx>,
}

/// Releases everything a running task holds when `start` exits, including
/// when the `start` future is dropped half way.
struct Teardown<'a> {
    task: &'a IncrementalTask,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.task.stop_tx.send_replace(true);
        self.task.data_sources.close();

        let mut state = self.task.lock_state();
        if *state == TaskState::Running {
            warn!(task_id = %self.task.config.task_id, "Task interrupted");
            *state = TaskState::Stopped;
        }
    }
}

impl IncrementalTask {
    pub fn new(
        config: TaskConfig,
        sources: Arc<dyn SourceFactory>,
        targets: Arc<dyn TargetFactory>,
    ) -> Self {
        let start = config.start_position.unwrap_or_default();
        let progress = Arc::new(Progress::new(start, config.checkpoint_policy));
        let engine = ExecuteEngine::new(format!("{}-importers", config.task_id));
        let (stop_tx, _) = stop_signal();

        Self {
            config,
            sources,
            targets,
            engine,
            data_sources: DataSourceManager::new(),
            progress,
            state: Mutex::new(TaskState::Idle),
            stop_tx: Arc::new(stop_tx),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.config.task_id
    }

    pub fn state(&self) -> TaskState {
        *self.lock_state()
    }

    /// Checkpoint and lag, as of now.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Observes every checkpoint the task commits.
    pub fn subscribe_checkpoint(&self) -> watch::Receiver<Position> {
        self.progress.subscribe()
    }

    /// Data-source handles currently held by the task.
    pub fn open_data_sources(&self) -> usize {
        self.data_sources.open_count()
    }

    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, state: TaskState) {
        *self.lock_state() = state;
    }

    /// Requests the dumper to stop. Importers finish the records already
    /// admitted to the channel. Safe to call at any time, any number of
    /// times.
    pub fn stop(&self) {
        if !self.stop_tx.send_replace(true) {
            info!(task_id = %self.config.task_id, "Stop requested");
        }

        let mut state = self.lock_state();
        if *state == TaskState::Idle {
            *state = TaskState::Stopped;
        }
    }

    /// Runs the task until the source is exhausted, `stop` is called, or a
    /// worker fails.
    ///
    /// Returns [`Error::Execution`] when the dumper or any importer failed.
    /// Every data source opened for the task is closed before this returns.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if *state != TaskState::Idle {
                return Err(Error::InvalidState(format!(
                    "task {} cannot start from state {}",
                    self.config.task_id, *state
                )));
            }
            *state = TaskState::Running;
        }

        let span = tracing::info_span!("incremental_task", task_id = %self.config.task_id);
        let teardown = Teardown { task: self };

        let result = self.run().instrument(span).await;
        match &result {
            Ok(()) => self.finish(TaskState::Stopped),
            Err(_) => self.finish(TaskState::Failed),
        }

        drop(teardown);
        result
    }

    async fn run(&self) -> Result<()> {
        let task_id = &self.config.task_id;
        self.progress.mark_active();

        let start = self.progress.position();
        info!(
            "Starting task from position {} with {} importer(s)",
            start, self.config.concurrency
        );

        let source = self
            .sources
            .new_source(&self.data_sources, self.progress.subscribe())
            .await
            .map_err(|err| err.into_execution(task_id.as_str()))?;

        let mut targets = Vec::with_capacity(self.config.concurrency);
        for _ in 0..self.config.concurrency {
            let target = self
                .targets
                .new_target(&self.data_sources)
                .await
                .map_err(|err| err.into_execution(task_id.as_str()))?;
            targets.push(target);
        }

        let callback: Arc<dyn AckCallback> = self.progress.clone();
        let listener: Arc<dyn ImporterListener> = self.progress.clone();
        let (channel, lanes) = DistributionChannel::new(
            self.config.concurrency,
            self.config.channel_capacity,
            callback,
        );

        let importers: Vec<(String, BoxFuture<'static, Result<()>>)> = lanes
            .into_iter()
            .zip(targets)
            .map(|(lane, target)| {
                let importer =
                    Importer::new(lane, target, listener.clone(), self.config.batch_size);
                (importer.name(), importer.run().boxed())
            })
            .collect();

        let stop_tx = self.stop_tx.clone();
        let group = self.engine.submit_all(importers, move |name, err| {
            error!("Importer {} failed, stopping dumper: {}", name, err);
            stop_tx.send_replace(true);
        });

        let dumper = Dumper::new(source, start, channel, self.stop_tx.subscribe()).spawn();
        let (group_result, dumper_result) = tokio::join!(group.wait(), dumper.wait());

        match (group_result, dumper_result) {
            (Some(ExecuteResult::Failure(err)), dumper_result) => {
                if let Err(dumper_err) = dumper_result {
                    warn!("Dumper also ended with an error: {}", dumper_err);
                }
                error!("Task failed: {}", err);
                Err(err.into_execution(task_id.as_str()))
            }
            (_, Err(err)) => {
                error!("Dumper failed: {}", err);
                Err(err.into_execution(task_id.as_str()))
            }
            (Some(ExecuteResult::Success), Ok(())) => {
                info!("Task finished at position {}", self.progress.position());
                Ok(())
            }
            (None, Ok(())) => {
                warn!("Task group wait was interrupted");
                Ok(())
            }
        }
    }
}

impl fmt::Debug for IncrementalTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementalTask")
            .field("task_id", &self.config.task_id)
            .field("state", &self.state())
            .field("position", &self.progress.position())
            .finish()
    }
}

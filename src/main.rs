use anyhow::Context;
use cdc_migrate::checkpoint::{Checkpoint, CheckpointManager};
use cdc_migrate::{Config, IncrementalTask};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "cdc-migrate")]
#[command(about = "Incremental change-data migration between data stores", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting cdc-migrate");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    info!(
        task_id = %config.task.task_id,
        concurrency = config.task.concurrency,
        channel_capacity = config.task.channel_capacity,
        checkpoint_policy = ?config.task.checkpoint_policy,
        "Configuration summary"
    );

    let checkpoints = config.checkpoint.file.as_ref().map(CheckpointManager::new);

    let mut task_config = config.task.clone();
    if let Some(manager) = &checkpoints {
        if let Some(checkpoint) = manager
            .load_for(&task_config.task_id)
            .await
            .context("failed to load checkpoint")?
        {
            info!("Resuming from checkpoint {}", checkpoint.position);
            task_config.start_position = Some(checkpoint.position);
        }
    }

    let task = Arc::new(IncrementalTask::new(
        task_config,
        Arc::new(config.source.clone()),
        Arc::new(config.target.clone()),
    ));

    let stopper = task.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping");
            stopper.stop();
        }
    });

    let saver = checkpoints.clone().map(|manager| {
        spawn_checkpoint_saver(
            task.clone(),
            manager,
            Duration::from_secs(config.checkpoint.interval_secs.max(1)),
        )
    });

    let result = task.start().await;

    if let Some(saver) = saver {
        saver.abort();
    }
    if let Some(manager) = &checkpoints {
        let checkpoint = Checkpoint::from_snapshot(task.task_id(), &task.progress());
        manager
            .save(&checkpoint)
            .await
            .context("failed to save final checkpoint")?;
    }

    let snapshot = task.progress();
    info!(
        position = %snapshot.position,
        delay_ms = snapshot.delay_millis,
        "Task {} ended {}",
        task.task_id(),
        task.state()
    );

    if let Err(e) = &result {
        error!("{}", e);
    }
    result.context("incremental task failed")?;
    Ok(())
}

/// Saves the task's checkpoint every `interval` when it moved.
fn spawn_checkpoint_saver(
    task: Arc<IncrementalTask>,
    manager: CheckpointManager,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut saved = None;

        loop {
            ticker.tick().await;
            let snapshot = task.progress();
            if saved == Some(snapshot.position) {
                continue;
            }

            let checkpoint = Checkpoint::from_snapshot(task.task_id(), &snapshot);
            match manager.save(&checkpoint).await {
                Ok(()) => saved = Some(snapshot.position),
                Err(e) => warn!("Failed to save checkpoint: {}", e),
            }
        }
    })
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("cdc_migrate=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("cdc_migrate=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

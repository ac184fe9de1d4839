//! tasktree worker - Process Entry Point
//!
//! Claims work for one profile and runs it until the queue is empty (or
//! forever, when polling). Exit codes: 0 idle, 1 error, 3 superseded.

use std::sync::Arc;

use tasktree::blob::FsBlobStore;
use tasktree::{builtin, config::Config, create_task_db, run_loop, LoopExit, TaskWorker};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code when the coordinator has moved on from the running attempt.
const EXIT_SUPERSEDED: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasktree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: store={:?} data_dir={} profile={} worker={}",
        config.store,
        config.data_dir.display(),
        config.profile,
        config.worker_id
    );

    let db = create_task_db(config.store, config.data_dir.clone()).await?;
    let blobs = Arc::new(FsBlobStore::new(config.blob_dir()).await?);
    let worker = Arc::new(TaskWorker::new(
        db,
        blobs,
        Arc::new(builtin::registry()),
        config.worker_config(),
        config.worker_id.clone(),
    ));

    match run_loop(worker, config.loop_options()).await? {
        LoopExit::Idle => Ok(()),
        LoopExit::Superseded => {
            info!("Attempt superseded; exiting");
            std::process::exit(EXIT_SUPERSEDED);
        }
    }
}

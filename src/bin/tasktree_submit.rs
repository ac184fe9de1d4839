//! tasktree-submit - job submission and status utility.
//!
//! ```text
//! tasktree-submit <type> <state-json> [user]
//! tasktree-submit status <job_id>
//! tasktree-submit cancel <job_id> [reason]
//! tasktree-submit resurrect <job_id>
//! tasktree-submit erase <job_id>
//! ```

use std::sync::Arc;

use anyhow::{bail, Context};
use tasktree::blob::FsBlobStore;
use tasktree::store::SummaryIndex;
use tasktree::{builtin, config::Config, create_task_db, TaskWorker};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: tasktree-submit <type> <state-json> [user]
       tasktree-submit status <job_id>
       tasktree-submit cancel <job_id> [reason]
       tasktree-submit resurrect <job_id>
       tasktree-submit erase <job_id>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasktree=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_env()?;
    let db = create_task_db(config.store, config.data_dir.clone()).await?;
    let blobs = Arc::new(FsBlobStore::new(config.blob_dir()).await?);
    let worker = TaskWorker::new(
        db.clone(),
        blobs,
        Arc::new(builtin::registry()),
        config.worker_config(),
        config.worker_id.clone(),
    );

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["status", job_id] => {
            let key = vec![job_id.to_string()];
            let summary = db
                .find_range(SummaryIndex::ByJob, &key, &key, None, 2)
                .await?;
            if summary.is_empty() {
                bail!("job {} not found", job_id);
            }
            for group in &summary {
                println!(
                    "{:<16} {:>6} nodes  {:>7.3} / {:.3}",
                    group.key.get(1).map(String::as_str).unwrap_or(""),
                    group.count,
                    group.progress,
                    group.total_progress
                );
            }
            let progress = worker.job_progress(job_id).await?;
            println!("progress {:.1}%", progress * 100.0);
        }
        ["cancel", job_id, rest @ ..] => {
            let reason = if rest.is_empty() {
                "cancelled by operator".to_string()
            } else {
                rest.join(" ")
            };
            if !worker.cancel_job(job_id, &reason).await? {
                println!("job {} already finished", job_id);
            }
        }
        ["resurrect", job_id] => {
            let revived = worker.resurrect_job(job_id).await?;
            println!("revived {} nodes", revived);
        }
        ["erase", job_id] => {
            let erased = worker.erase_job(job_id).await?;
            println!("erased {} nodes", erased);
        }
        [task_type, state, rest @ ..] if rest.len() <= 1 => {
            // Validate early for a readable error
            serde_json::from_str::<serde_json::Value>(state)
                .with_context(|| format!("state for {} is not valid JSON", task_type))?;
            let user = rest
                .first()
                .map(|u| u.to_string())
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "anonymous".to_string());
            let job_id = worker
                .submit_job(task_type, &user, state.as_bytes().to_vec())
                .await?;
            println!("{}", job_id);
        }
        _ => bail!("{}", USAGE),
    }
    Ok(())
}

mod handlers;
mod observability;
mod runner;

use std::sync::Arc;

use reverie_domain::ports::jobs::JobQueue;
use reverie_infra::jobs::RedisJobQueue;
use reverie_infra::{config::AppConfig, logging::init_tracing};
use tracing::info;

use crate::handlers::{JobHandler, LogNotificationSink};
use crate::runner::{Worker, WorkerSettings};

const REQUEUE_ON_START_LIMIT: usize = 1_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config, "reverie-worker")?;
    observability::init_metrics()?;

    if !config.uses_redis() {
        // With the memory backend the api logs workflow triggers instead of queueing them.
        info!("store_backend is not redis; nothing to consume");
        let _ = tokio::signal::ctrl_c().await;
        info!("worker shutdown");
        return Ok(());
    }

    let queue = Arc::new(
        RedisJobQueue::connect_with_prefix(&config.redis_url, &config.worker_queue_prefix).await?,
    );
    let recovered = queue.requeue_processing(REQUEUE_ON_START_LIMIT).await?;
    if recovered > 0 {
        info!(recovered, "requeued jobs left in processing by a previous run");
    }
    tokio::spawn(report_queue_depth(queue.clone()));

    let worker = Worker::new(
        queue,
        JobHandler::new(LogNotificationSink),
        WorkerSettings::from_config(&config),
    );
    info!(prefix = %config.worker_queue_prefix, "worker starting");
    worker
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    info!("worker shutdown");

    Ok(())
}

async fn report_queue_depth(queue: Arc<RedisJobQueue>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(15));
    loop {
        interval.tick().await;
        match queue.metrics_snapshot().await {
            Ok(snapshot) => {
                observability::set_queue_depth_gauge(
                    snapshot.ready,
                    snapshot.delayed,
                    snapshot.processing,
                );
                if let Some(oldest) = snapshot.oldest_delayed_ms {
                    tracing::debug!(oldest_delayed_ms = oldest, "delayed queue head");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to read queue depth"),
        }
    }
}

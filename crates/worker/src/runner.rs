use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reverie_domain::clock::now_ms;
use reverie_domain::jobs::{InMemoryJobQueue, backoff_ms};
use reverie_domain::ports::BoxFuture;
use reverie_domain::ports::jobs::{JobEnvelope, JobQueue, JobQueueError};
use reverie_infra::config::AppConfig;
use reverie_infra::jobs::RedisJobQueue;

use crate::handlers::{JobHandler, NotificationSink};
use crate::observability;

/// A queue that can hand an in-flight job back for a later attempt.
pub trait RetryQueue: JobQueue {
    fn retry_later(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>>;
}

impl RetryQueue for RedisJobQueue {
    fn retry_later(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        Box::pin(async move { self.restore_processing_with_retry_delay(&job).await })
    }
}

impl RetryQueue for InMemoryJobQueue {
    fn retry_later(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        Box::pin(async move {
            self.ack(&job.job_id).await?;
            self.enqueue(&job).await
        })
    }
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub promote_batch: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
            promote_batch: config.worker_promote_batch,
            backoff_base_ms: config.worker_backoff_base_ms,
            backoff_max_ms: config.worker_backoff_max_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Completed,
    Retried,
    Dropped,
}

pub struct Worker<Q, S> {
    queue: Arc<Q>,
    handler: JobHandler<S>,
    settings: WorkerSettings,
}

impl<Q: RetryQueue, S: NotificationSink> Worker<Q, S> {
    pub fn new(queue: Arc<Q>, handler: JobHandler<S>, settings: WorkerSettings) -> Self {
        Self {
            queue,
            handler,
            settings,
        }
    }

    /// Promotes due jobs, then takes at most one job through its handler.
    pub async fn tick(&self) -> Result<TickOutcome, JobQueueError> {
        let promoted = self
            .queue
            .promote_due(now_ms(), self.settings.promote_batch)
            .await?;
        if promoted > 0 {
            tracing::debug!(promoted, "promoted delayed jobs");
        }

        let Some(job) = self.queue.dequeue(self.settings.poll_interval).await? else {
            return Ok(TickOutcome::Idle);
        };
        observability::set_queue_lag_ms(now_ms() - job.run_at_ms);

        let started = Instant::now();
        let result = self.handler.handle(&job);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        let job_type = job.job_type.as_str();

        match result {
            Ok(()) => {
                self.queue.ack(&job.job_id).await?;
                observability::register_job_processed(job_type, "success", elapsed_ms);
                Ok(TickOutcome::Completed)
            }
            Err(err) if err.is_retryable() && !job.is_exhausted() => {
                let delay = backoff_ms(
                    self.settings.backoff_base_ms,
                    job.attempt,
                    self.settings.backoff_max_ms,
                );
                let mut next = job.clone().with_run_at(now_ms() + delay as i64);
                next.attempt = job.next_attempt();
                tracing::warn!(
                    job_id = %job.job_id,
                    job_type,
                    attempt = job.attempt,
                    delay_ms = delay,
                    error = %err,
                    "job failed; scheduling retry"
                );
                self.queue.retry_later(&next).await?;
                observability::register_job_processed(job_type, "retry", elapsed_ms);
                Ok(TickOutcome::Retried)
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job.job_id,
                    job_type,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    error = %err,
                    "job dropped"
                );
                self.queue.ack(&job.job_id).await?;
                observability::register_job_processed(job_type, "dropped", elapsed_ms);
                Ok(TickOutcome::Dropped)
            }
        }
    }

    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("worker stopping");
                    return;
                }
                outcome = self.tick() => match outcome {
                    Ok(TickOutcome::Idle) => tokio::time::sleep(self.settings.poll_interval).await,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "job queue error");
                        tokio::time::sleep(self.settings.poll_interval).await;
                    }
                },
            }
        }
    }
}
